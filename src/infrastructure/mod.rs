pub mod input_reader;
pub mod job_store;

pub use input_reader::PreparedInput;
pub use job_store::{InMemoryJobStore, JobStore, JsonDirJobStore};
