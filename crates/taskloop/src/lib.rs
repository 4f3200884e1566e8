//! taskloop - bounded agent iteration engine.
//!
//! Drives the agent CLI through repeated invocations until the work is
//! verified complete, enforcing iteration and spend limits. Two execution
//! modes share one completion protocol:
//! - the simple loop repeats a single prompt
//! - the gated outer loop runs a multi-step workflow with quality gates

pub mod driver;
pub mod error;
pub mod executor;
pub mod progress;
mod simple_loop;
pub mod state;
pub mod verifier;
pub mod workflow_runner;

use std::path::Path;
use std::sync::Arc;

use taskloop_core::{Config, ProgressObserver};

pub use driver::{Driver, Limits};
pub use error::{LoopError, RunError, RunResult};
pub use executor::{ClaudeExecutor, ExecError, Executor, ExecutorConfig};
pub use progress::{ReportObserver, TracingObserver};
pub use state::{FileStore, RunStore, StoreError};
pub use verifier::{AgentVerifier, Verifier, VerifyError};

/// Report file name inside the state directory.
pub const REPORT_FILE: &str = "report.tsv";

/// Build a driver wired to the Claude CLI for `workspace_root`.
///
/// Progress is always logged; `report.tsv` is appended when `config.report`
/// is set.
pub fn claude_driver(
    config: &Config,
    workspace_root: &Path,
    store: Arc<dyn RunStore>,
) -> std::io::Result<Driver> {
    let executor: Arc<dyn Executor> = Arc::new(ClaudeExecutor::new(ExecutorConfig::from_config(
        config,
        workspace_root,
    )));
    let verifier = Arc::new(AgentVerifier::new(Arc::clone(&executor)));

    let mut observers: Vec<Box<dyn ProgressObserver>> = vec![Box::new(TracingObserver)];
    if config.report {
        std::fs::create_dir_all(&config.state_dir)?;
        observers.push(Box::new(ReportObserver::new(
            &config.state_dir.join(REPORT_FILE),
        )?));
    }

    Ok(Driver::from_config(config, executor, verifier, store).with_observer(Arc::new(observers)))
}
