//! Prompt assembly.
//!
//! Step prompts are minijinja templates rendered with a [`PromptContext`].
//! The simple loop prompt is assembled from the task text plus `@file`
//! references so the agent reads the target files itself.

use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;

use crate::completion::DEFAULT_PROMISE;
use crate::gate::{DEFAULT_FAIL_TAG, DEFAULT_PASS_TAG};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to render prompt for step {step}: {source}")]
    Render {
        step: String,
        #[source]
        source: minijinja::Error,
    },
}

/// Variables available to step prompt templates.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    /// The user's task text.
    pub task: String,
    /// Active target files.
    pub files: Vec<String>,
    /// Files as a space-separated `@path` list.
    pub file_refs: String,
    /// Name of the step being rendered.
    pub step: String,
    pub promise: String,
    pub gate_pass_tag: String,
    pub gate_fail_tag: String,
}

impl PromptContext {
    pub fn new(task: impl Into<String>, files: &[PathBuf]) -> Self {
        Self {
            task: task.into(),
            files: files.iter().map(|f| f.display().to_string()).collect(),
            file_refs: file_refs(files),
            step: String::new(),
            promise: DEFAULT_PROMISE.to_string(),
            gate_pass_tag: DEFAULT_PASS_TAG.to_string(),
            gate_fail_tag: DEFAULT_FAIL_TAG.to_string(),
        }
    }

    pub fn with_promise(mut self, promise: impl Into<String>) -> Self {
        self.promise = promise.into();
        self
    }

    pub fn with_gate_tags(mut self, pass: impl Into<String>, fail: impl Into<String>) -> Self {
        self.gate_pass_tag = pass.into();
        self.gate_fail_tag = fail.into();
        self
    }

    /// Context for a specific step.
    pub fn for_step(&self, step: &str) -> Self {
        let mut ctx = self.clone();
        ctx.step = step.to_string();
        ctx
    }
}

/// Render a step prompt template.
///
/// Unknown variables are an error so typos in workflow definitions surface on
/// the first execution instead of silently producing an empty prompt section.
pub fn render(template: &str, ctx: &PromptContext) -> Result<String, PromptError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(template, ctx)
        .map_err(|source| PromptError::Render {
            step: ctx.step.clone(),
            source,
        })
}

/// Format files as `@path` references.
pub fn file_refs(files: &[impl AsRef<Path>]) -> String {
    files
        .iter()
        .map(|f| format!("@{}", f.as_ref().display()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the simple loop prompt: file references, the task, and the
/// completion instruction.
pub fn build_loop_prompt(task: &str, files: &[PathBuf], promise: &str) -> String {
    let refs = file_refs(files);
    let mut prompt = String::new();
    if !refs.is_empty() {
        prompt.push_str(&refs);
        prompt.push_str("\n\n");
    }
    prompt.push_str(task.trim_end());
    prompt.push_str(&format!(
        "\n\nWhen (and only when) every task is complete, output {promise}."
    ));
    prompt
}
