//! Configuration loading.
//!
//! Config files are TOML. Layers are merged key by key, later layers winning:
//! defaults < global (`~/.config/taskloop/config.toml`) < workspace
//! (`.taskloop/config.toml`) < `--config` file. CLI flags are applied on top by
//! the binary.

use std::path::{Path, PathBuf};

use thiserror::Error;
use toml::Table;

use crate::completion::{CompletionDetector, DEFAULT_PROMISE};
use crate::gate::{GateClassifier, DEFAULT_FAIL_TAG, DEFAULT_PASS_TAG};
use crate::workflow::Workflow;

/// Name of the per-workspace state directory.
pub const STATE_DIR: &str = ".taskloop";
/// Config file name inside the state and global config directories.
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Run configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Agent
    pub model: String,
    pub claude_bin: PathBuf,
    /// Timeout per agent invocation in seconds (0 = no timeout).
    pub claude_timeout_sec: u32,

    // Limits
    pub max_iterations: u32,
    /// Spend limit in USD. Reaching it exactly stops the run.
    pub max_budget: f64,

    // Signals
    pub completion_promise: String,
    pub gate_pass_tag: String,
    pub gate_fail_tag: String,

    // Targets
    /// Initial target files (plans, checklists) handed to the verifier.
    pub files: Vec<PathBuf>,

    // State
    pub state_dir: PathBuf,
    /// Append per-iteration rows to `report.tsv` in the state directory.
    pub report: bool,

    pub workflow: Workflow,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "opus".to_string(),
            claude_bin: PathBuf::from("claude"),
            claude_timeout_sec: 600,
            max_iterations: 50,
            max_budget: 10.0,
            completion_promise: DEFAULT_PROMISE.to_string(),
            gate_pass_tag: DEFAULT_PASS_TAG.to_string(),
            gate_fail_tag: DEFAULT_FAIL_TAG.to_string(),
            files: Vec::new(),
            state_dir: PathBuf::from(STATE_DIR),
            report: true,
            workflow: Workflow::from_preset("default"),
        }
    }
}

impl Config {
    /// Load a single config file over the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let table = read_table(path)?;
        Self::from_table(table, path)
    }

    /// Load all config layers for a workspace.
    ///
    /// Missing global/workspace files are skipped; a missing explicit file is
    /// an error.
    pub fn load(workspace_root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut merged = Table::new();
        let mut last_path = workspace_root.join(STATE_DIR).join(CONFIG_FILE);

        let mut layers: Vec<PathBuf> = Vec::new();
        if let Some(global) = global_config_path() {
            layers.push(global);
        }
        layers.push(last_path.clone());

        for path in layers {
            if path.is_file() {
                merge_tables(&mut merged, read_table(&path)?);
                last_path = path;
            }
        }

        if let Some(path) = explicit {
            merge_tables(&mut merged, read_table(path)?);
            last_path = path.to_path_buf();
        }

        let mut config = Self::from_table(merged, &last_path)?;
        config.resolve_paths(workspace_root);
        Ok(config)
    }

    /// Parse TOML content over the defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let path = PathBuf::from("<inline>");
        let table: Table = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Self::from_table(table, &path)
    }

    fn from_table(table: Table, path: &Path) -> Result<Self> {
        let config: Self =
            toml::Value::Table(table)
                .try_into()
                .map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
        config.check()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_budget.is_nan() || self.max_budget <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "max_budget must be positive, got {}",
                self.max_budget
            )));
        }
        if self.completion_promise.is_empty() {
            return Err(ConfigError::Invalid(
                "completion_promise must not be empty".to_string(),
            ));
        }
        if self.gate_pass_tag.is_empty() || self.gate_fail_tag.is_empty() {
            return Err(ConfigError::Invalid(
                "gate_pass_tag and gate_fail_tag must not be empty".to_string(),
            ));
        }
        if self.gate_pass_tag == self.gate_fail_tag {
            return Err(ConfigError::Invalid(
                "gate_pass_tag and gate_fail_tag must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = workspace_root.join(&self.state_dir);
        }
        for file in &mut self.files {
            if file.is_relative() {
                *file = workspace_root.join(&*file);
            }
        }
    }

    pub fn completion_detector(&self) -> CompletionDetector {
        CompletionDetector::new(&self.completion_promise)
    }

    pub fn gate_classifier(&self) -> GateClassifier {
        GateClassifier::new(&self.gate_pass_tag, &self.gate_fail_tag)
    }
}

/// Global config file location (`~/.config/taskloop/config.toml`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("taskloop").join(CONFIG_FILE))
}

fn read_table(path: &Path) -> Result<Table> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge `overlay` into `base`. Nested tables merge recursively; any other
/// value (arrays included) replaces the base value.
fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_iterations, 50);
        assert!((config.max_budget - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.completion_promise, DEFAULT_PROMISE);
        assert_eq!(config.workflow.preset.as_deref(), Some("default"));
        assert!(config.check().is_ok());
    }

    #[test]
    fn parse_overrides_defaults() {
        let config = Config::parse(
            r#"
model = "sonnet"
max_iterations = 7
max_budget = 2.5
files = ["plan.md"]
"#,
        )
        .unwrap();
        assert_eq!(config.model, "sonnet");
        assert_eq!(config.max_iterations, 7);
        assert!((config.max_budget - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.files, vec![PathBuf::from("plan.md")]);
        assert_eq!(config.claude_timeout_sec, 600);
    }

    #[test]
    fn parse_inline_workflow() {
        let config = Config::parse(
            r#"
[workflow]
name = "gated"
max_gate_retries = 2

[[workflow.steps]]
name = "implement"
prompt = "{{ task }}"

[[workflow.steps]]
name = "review"
prompt = "review"
gate = true
on_fail = "implement"
"#,
        )
        .unwrap();
        assert!(config.workflow.has_gates());
        assert_eq!(config.workflow.effective_max_gate_retries(), 2);
        assert!(config.workflow.preset.is_none());
    }

    #[test]
    fn rejects_zero_iterations() {
        let err = Config::parse("max_iterations = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_non_positive_budget() {
        assert!(Config::parse("max_budget = 0.0").is_err());
        assert!(Config::parse("max_budget = -1.0").is_err());
    }

    #[test]
    fn rejects_identical_gate_tags() {
        let err = Config::parse("gate_pass_tag = \"X\"\ngate_fail_tag = \"X\"").unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn rejects_bad_toml() {
        let err = Config::parse("max_iterations = \"ten\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_merges_workspace_and_explicit_layers() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            ".taskloop/config.toml",
            "model = \"sonnet\"\nmax_iterations = 5\n[workflow]\npreset = \"review\"\n",
        );
        let explicit = write(
            dir.path(),
            "override.toml",
            "max_iterations = 9\n[workflow]\nmax_gate_retries = 4\n",
        );

        let config = Config::load(dir.path(), Some(&explicit)).unwrap();
        assert_eq!(config.model, "sonnet");
        assert_eq!(config.max_iterations, 9);
        assert_eq!(config.workflow.preset.as_deref(), Some("review"));
        assert_eq!(config.workflow.max_gate_retries, 4);
        assert_eq!(config.state_dir, dir.path().join(STATE_DIR));
    }

    #[test]
    fn load_missing_explicit_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(dir.path(), Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn resolve_paths_joins_relative() {
        let mut config = Config {
            files: vec![PathBuf::from("plan.md"), PathBuf::from("/abs/todo.md")],
            ..Config::default()
        };
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.state_dir, PathBuf::from("/work/.taskloop"));
        assert_eq!(
            config.files,
            vec![PathBuf::from("/work/plan.md"), PathBuf::from("/abs/todo.md")]
        );
    }

    #[test]
    fn merge_tables_is_recursive() {
        let mut base: Table = toml::from_str("a = 1\n[t]\nx = 1\ny = 2").unwrap();
        let overlay: Table = toml::from_str("[t]\ny = 3").unwrap();
        merge_tables(&mut base, overlay);
        assert_eq!(base["a"].as_integer(), Some(1));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_integer(), Some(3));
    }
}
