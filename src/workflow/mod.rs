pub mod extraction_flow;
pub mod job_ctx;

pub use extraction_flow::{ExtractionFlow, FlowOutcome};
pub use job_ctx::JobCtx;
