//! Admission engine: event de-duplication and debounce, the decision
//! pipeline, and dispatch to enforcement.

pub mod admission;
pub mod pipeline;
pub mod prompt;

pub use admission::{AdmissionEngine, AttachOutcome, Enforced, Handled, Ingest};
pub use pipeline::{DecisionPipeline, Verdict};
pub use prompt::{CommandPrompter, DenyPrompter, PromptReply, Prompter, TerminalPrompter};
