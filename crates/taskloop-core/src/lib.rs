pub mod completion;
pub mod config;
pub mod events;
pub mod gate;
pub mod prompt;
pub mod report;
pub mod types;
pub mod verification;
pub mod workflow;

pub use config::Config;
pub use events::{NoopObserver, ProgressObserver, RunEvent, StepProgress};
pub use report::{ReportRow, ReportWriter};
pub use types::*;
pub use workflow::{Step, Workflow, WorkflowError};
