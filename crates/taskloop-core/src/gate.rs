//! Gate classification for workflow gate steps.
//!
//! A gate step's output may contain a pass tag, a fail tag, both, or neither.
//! When both appear, the tag whose last occurrence is later wins, so an agent
//! that first reports a failure and then fixes it is read as passing.

use crate::types::GateResult;

/// Default tag a gate step emits when its check passes.
pub const DEFAULT_PASS_TAG: &str = "<gate>PASS</gate>";
/// Default tag a gate step emits when its check fails.
pub const DEFAULT_FAIL_TAG: &str = "<gate>FAIL</gate>";

/// Stateless pass/fail classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateClassifier {
    pass_tag: String,
    fail_tag: String,
}

impl GateClassifier {
    pub fn new(pass_tag: impl Into<String>, fail_tag: impl Into<String>) -> Self {
        Self {
            pass_tag: pass_tag.into(),
            fail_tag: fail_tag.into(),
        }
    }

    pub fn pass_tag(&self) -> &str {
        &self.pass_tag
    }

    pub fn fail_tag(&self) -> &str {
        &self.fail_tag
    }

    /// Classify a gate step's output.
    ///
    /// # Example
    /// ```
    /// use taskloop_core::gate::GateClassifier;
    /// use taskloop_core::GateResult;
    ///
    /// let gate = GateClassifier::default();
    /// assert_eq!(gate.check_gate("<gate>FAIL</gate> fixed it <gate>PASS</gate>"), GateResult::Passed);
    /// assert_eq!(gate.check_gate("<gate>PASS</gate> then <gate>FAIL</gate>"), GateResult::Failed);
    /// assert_eq!(gate.check_gate("no verdict"), GateResult::NotFound);
    /// ```
    pub fn check_gate(&self, output: &str) -> GateResult {
        let pass = last_index(output, &self.pass_tag);
        let fail = last_index(output, &self.fail_tag);

        match (pass, fail) {
            (None, None) => GateResult::NotFound,
            (Some(_), None) => GateResult::Passed,
            (None, Some(_)) => GateResult::Failed,
            (Some(p), Some(f)) if p > f => GateResult::Passed,
            (Some(_), Some(_)) => GateResult::Failed,
        }
    }
}

impl Default for GateClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_PASS_TAG, DEFAULT_FAIL_TAG)
    }
}

fn last_index(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.rfind(needle)
}
