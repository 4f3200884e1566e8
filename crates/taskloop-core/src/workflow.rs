//! Workflow model: ordered steps, quality gates, and failure jumps.
//!
//! A workflow is either declared inline (`[[workflow.steps]]` in config) or
//! references a built-in preset. It must pass [`Workflow::validate`] before a
//! runner executes it; once valid it is read-only for the whole run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Gate retry limit used when `max_gate_retries` is 0.
pub const DEFAULT_MAX_GATE_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("workflow {workflow}: no steps and no preset")]
    Empty { workflow: String },
    #[error("steps[{index}].name: must not be empty")]
    EmptyStepName { index: usize },
    #[error("step {step}: prompt must not be empty")]
    EmptyPrompt { step: String },
    #[error("steps[{index}].name: duplicate step name {step}")]
    DuplicateStep { step: String, index: usize },
    #[error("step {step}: on_fail requires gate = true")]
    OnFailWithoutGate { step: String },
    #[error("step {step}: on_fail target {target} does not exist")]
    UnknownOnFailTarget { step: String, target: String },
    #[error("step {step}: deferred but no other step jumps to it via on_fail")]
    UnreachableDeferred { step: String },
    #[error("unknown workflow preset: {0}")]
    UnknownPreset(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// A single workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Prompt template, rendered per execution (see `prompt::render`).
    pub prompt: String,
    /// Gate steps have their output classified pass/fail.
    #[serde(default)]
    pub gate: bool,
    /// Step to jump to when this gate fails. Only meaningful for gates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<String>,
    /// Intended to run only as an `on_fail` target.
    ///
    /// Forward traversal does not skip deferred steps; the flag is only
    /// checked for reachability at validation time.
    #[serde(default)]
    pub deferred: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            gate: false,
            on_fail: None,
            deferred: false,
        }
    }

    /// Mark as a gate that jumps to `on_fail` on failure (or retries itself).
    pub fn gate(mut self, on_fail: Option<&str>) -> Self {
        self.gate = true;
        self.on_fail = on_fail.map(str::to_string);
        self
    }

    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

/// Static description of an ordered step pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub name: String,
    pub preset: Option<String>,
    pub steps: Vec<Step>,
    /// 0 means [`DEFAULT_MAX_GATE_RETRIES`].
    pub max_gate_retries: u32,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            preset: None,
            steps,
            max_gate_retries: 0,
        }
    }

    /// Reference a built-in preset; steps are filled in by [`Workflow::resolve`].
    pub fn from_preset(preset: impl Into<String>) -> Self {
        let preset = preset.into();
        Self {
            name: preset.clone(),
            preset: Some(preset),
            steps: Vec::new(),
            max_gate_retries: 0,
        }
    }

    pub fn with_max_gate_retries(mut self, max: u32) -> Self {
        self.max_gate_retries = max;
        self
    }

    /// Validate structure. Rules are applied in a fixed order and the first
    /// violated rule is reported.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() && self.preset.is_none() {
            return Err(WorkflowError::Empty {
                workflow: self.name.clone(),
            });
        }

        if let Some(index) = self.steps.iter().position(|s| s.name.is_empty()) {
            return Err(WorkflowError::EmptyStepName { index });
        }

        if let Some(step) = self.steps.iter().find(|s| s.prompt.is_empty()) {
            return Err(WorkflowError::EmptyPrompt {
                step: step.name.clone(),
            });
        }

        for (index, step) in self.steps.iter().enumerate() {
            if self.steps[..index].iter().any(|s| s.name == step.name) {
                return Err(WorkflowError::DuplicateStep {
                    step: step.name.clone(),
                    index,
                });
            }
        }

        if let Some(step) = self
            .steps
            .iter()
            .find(|s| s.on_fail.is_some() && !s.gate)
        {
            return Err(WorkflowError::OnFailWithoutGate {
                step: step.name.clone(),
            });
        }

        for step in &self.steps {
            if let Some(target) = &step.on_fail {
                if self.step_index(target).is_none() {
                    return Err(WorkflowError::UnknownOnFailTarget {
                        step: step.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        for step in self.steps.iter().filter(|s| s.deferred) {
            let reachable = self
                .steps
                .iter()
                .any(|other| other.name != step.name && other.on_fail.as_ref() == Some(&step.name));
            if !reachable {
                return Err(WorkflowError::UnreachableDeferred {
                    step: step.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Validate, expand a preset reference into steps, and validate again.
    ///
    /// Inline steps take precedence over the preset.
    pub fn resolve(mut self) -> Result<Self> {
        self.validate()?;
        if self.steps.is_empty() {
            if let Some(preset) = &self.preset {
                let expanded = preset_workflow(preset)?;
                self.steps = expanded.steps;
                if self.name.is_empty() {
                    self.name = expanded.name;
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// 0-based position of the named step.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn effective_max_gate_retries(&self) -> u32 {
        if self.max_gate_retries > 0 {
            self.max_gate_retries
        } else {
            DEFAULT_MAX_GATE_RETRIES
        }
    }

    pub fn has_gates(&self) -> bool {
        self.steps.iter().any(|s| s.gate)
    }
}

/// Names of the built-in presets.
pub const PRESETS: &[&str] = &["default", "review", "tdd"];

const IMPLEMENT_PROMPT: &str = "{{ file_refs }}

{{ task }}

Pick ONE unchecked item from the files above, implement it, and mark it [x].
When every item is checked, output {{ promise }}.";

const REVIEW_PROMPT: &str = "{{ file_refs }}

You are reviewing the most recent changes for correctness and quality against the files above.
If the changes are acceptable, output {{ gate_pass_tag }}.
Otherwise list the problems and output {{ gate_fail_tag }}.";

const TESTS_PROMPT: &str = "{{ file_refs }}

{{ task }}

Write failing tests for ONE unchecked item from the files above. Do not implement it yet.";

const CHECK_PROMPT: &str = "{{ file_refs }}

Run the test suite.
If every test passes, output {{ gate_pass_tag }}.
Otherwise summarize the failures and output {{ gate_fail_tag }}.";

/// Look up a built-in preset by name.
pub fn preset_workflow(name: &str) -> Result<Workflow> {
    let steps = match name {
        "default" => vec![Step::new("implement", IMPLEMENT_PROMPT)],
        "review" => vec![
            Step::new("implement", IMPLEMENT_PROMPT),
            Step::new("review", REVIEW_PROMPT).gate(Some("implement")),
        ],
        "tdd" => vec![
            Step::new("tests", TESTS_PROMPT),
            Step::new("implement", IMPLEMENT_PROMPT),
            Step::new("check", CHECK_PROMPT).gate(Some("implement")),
        ],
        _ => return Err(WorkflowError::UnknownPreset(name.to_string())),
    };

    Ok(Workflow {
        name: name.to_string(),
        preset: Some(name.to_string()),
        steps,
        max_gate_retries: 0,
    })
}
