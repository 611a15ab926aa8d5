pub mod acme;
pub mod challenge;
pub mod delay;
pub mod dns_providers;
pub mod error;
pub mod flow;
pub mod issuer;
pub mod keys;
pub mod orchestrator;

pub use challenge::{ChallengeDescriptor, CleanupSet, RecordKey};
pub use error::IssuanceError;
pub use flow::{IssuanceWorkflow, RunReport, WorkflowSettings};
pub use orchestrator::{ChallengeOrchestrator, OrchestrationOutcome, PollPolicy};
