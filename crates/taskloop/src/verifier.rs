//! Completion verification.
//!
//! When an iteration claims completion, a separate checker invocation counts
//! checklist items in the target files. The checker's answer is parsed with
//! [`parse_verification_response`]; an unparseable answer is reported as
//! `(-1, -1)` rather than an error so the loop simply continues.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use taskloop_core::verification::{parse_verification_response, verification_prompt};
use taskloop_core::VerificationResult;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::executor::{ExecError, Executor};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verification call failed: {0}")]
    Exec(#[from] ExecError),
}

impl VerifyError {
    /// Cost already spent by a failed verification call.
    pub fn partial_cost(&self) -> (f64, u64) {
        match self {
            Self::Exec(err) => err
                .partial()
                .map_or((0.0, 0), |p| (p.cost_usd, p.tokens_in + p.tokens_out)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Exec(err) => err.is_cancelled(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// Verification collaborator.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        cancel: &CancellationToken,
        files: &[PathBuf],
    ) -> Result<VerificationResult>;
}

/// Verifier that asks the agent itself to count checklist items.
pub struct AgentVerifier {
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for AgentVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentVerifier").finish_non_exhaustive()
    }
}

impl AgentVerifier {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Verifier for AgentVerifier {
    async fn verify(
        &self,
        cancel: &CancellationToken,
        files: &[PathBuf],
    ) -> Result<VerificationResult> {
        let prompt = verification_prompt(files);
        debug!(files = files.len(), "running verification");

        let outcome = self.executor.execute(cancel, &prompt).await?;
        let (verified, unchecked, checked) = parse_verification_response(&outcome.output);

        info!(
            verified,
            unchecked,
            checked,
            cost_usd = outcome.cost_usd,
            "verification finished"
        );

        Ok(VerificationResult {
            verified,
            unchecked,
            checked,
            cost: outcome.cost_usd,
            tokens: outcome.tokens_in + outcome.tokens_out,
        })
    }
}
