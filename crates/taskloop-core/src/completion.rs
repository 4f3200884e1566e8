//! Completion detection for agent output.
//!
//! An iteration claims completion when its output contains the configured
//! promise string anywhere. The match is exact and case-sensitive; whether the
//! claim holds is decided later by verification.

/// The default promise that signals task completion.
pub const DEFAULT_PROMISE: &str = "<promise>COMPLETE</promise>";

/// Stateless predicate over agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionDetector {
    promise: String,
}

impl CompletionDetector {
    /// Create a detector for the given promise string.
    pub fn new(promise: impl Into<String>) -> Self {
        Self {
            promise: promise.into(),
        }
    }

    /// The configured promise string.
    pub fn promise(&self) -> &str {
        &self.promise
    }

    /// Check if the output contains the promise.
    ///
    /// # Example
    /// ```
    /// use taskloop_core::completion::CompletionDetector;
    ///
    /// let detector = CompletionDetector::default();
    /// assert!(detector.check("All done.\n<promise>COMPLETE</promise>"));
    /// assert!(detector.check("Almost <promise>COMPLETE</promise> done."));
    /// assert!(!detector.check("<promise>complete</promise>"));
    /// ```
    pub fn check(&self, output: &str) -> bool {
        !self.promise.is_empty() && output.contains(&self.promise)
    }
}

impl Default for CompletionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_PROMISE)
    }
}
