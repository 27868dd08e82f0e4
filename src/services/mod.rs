pub mod address_parser;
pub mod extraction;
pub mod job_manager;
pub mod reconciler;
pub mod recognition;
pub mod validation;

pub use address_parser::{AddressParser, ParsedAddress};
pub use extraction::Extractor;
pub use job_manager::JobManager;
pub use reconciler::{apply_manual_edit, backfill, reconcile, reconcile_maps, FieldConflict, MergeResult};
pub use recognition::{LlmRecognizer, RecognizedField, RecognizedFields, Recognizer};
pub use validation::{validate, validate_record, FieldIssue, ValidationResult};
