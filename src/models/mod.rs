pub mod candidate;
pub mod field;
pub mod job;
pub mod loaders;
pub mod us_states;

pub use candidate::{
    AuthoritativeRecord, CandidateFieldSet, CandidateSource, ConfidenceMap, FieldSlot,
    FieldSources, SourceLabel,
};
pub use field::{FieldName, FieldValues};
pub use job::{
    Job, JobId, JobResultView, JobState, JobStatusView, PipelineStage, RawInput, ResultLookup,
    StatusLookup,
};
pub use loaders::{load_inbox, load_manual_edits, InboxItem};
