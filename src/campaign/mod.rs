pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod settings;

pub use ledger::EmailStatus;
pub use orchestrator::{ComposedEmail, Orchestrator, RunState, RunStatus, TokioClock};
pub use settings::{CampaignConfig, SendMode};
