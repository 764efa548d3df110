use anyhow::{Context, Result};
use config::{Config, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable engine configuration, passed into every component constructor
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Repository layout
    pub repository: RepositoryConfig,
    /// External CLI locations
    pub tools: ToolsConfig,
    /// Pre-flight and pre-rollback safety rules
    pub safety: SafetyConfig,
    /// Rollback strategies
    pub rollback: RollbackConfig,
    /// Patch workflow settings
    pub patch: PatchConfig,
    /// Review monitoring settings
    pub monitor: MonitorConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Working tree every command runs in
    pub root: PathBuf,
    /// Remote that patch branches are pushed to
    pub remote: String,
    /// Base branch used when a request does not name one
    pub default_base_branch: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Version-control CLI
    pub git: String,
    /// Review-system CLI
    pub review: String,
    /// Install command per tool name, used when missing tools may be installed
    pub install_commands: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Branch names or `*` patterns that emergency rollback may never touch
    pub protected_branches: Vec<String>,
    /// Files (or directories, with a trailing `/`) whose rollback deserves a warning
    pub critical_files: Vec<String>,
    /// Rolling back further than this many days is warned about
    pub max_revision_age_days: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Commits scanned when looking for a known-good state
    pub history_window: usize,
    /// Commit subjects matching this regex mark a validated state
    pub validated_marker: String,
    /// Commits scanned when looking for the engine's own last commit
    pub emergency_scan_depth: usize,
    /// Reset depth when emergency rollback finds no engine commit
    pub emergency_fallback_depth: usize,
    /// Transient build/artifact directories removed by emergency rollback
    pub transient_directories: Vec<String>,
    /// Where pre-rollback backups are written, relative to the root
    pub backup_dir: PathBuf,
    /// Where rollback reports are written, relative to the root
    pub report_dir: PathBuf,
    /// Files that must still exist after a rollback
    pub required_files: Vec<String>,
    /// Command proving core modules still load after a rollback
    pub validation_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Prefix of every commit the engine creates; also the engine's marker
    pub commit_prefix: String,
    /// Prefix of generated patch branch names
    pub branch_prefix: String,
    /// Command run after the change is applied unless validation is skipped
    pub validation_command: Option<Vec<String>>,
    /// How long to wait for the working-tree lock
    pub lock_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sleep between polls
    pub poll_interval_secs: u64,
    /// Time budget of the suggestion loop
    pub suggestion_budget_secs: u64,
    /// Time budget of the ticket loop
    pub ticket_budget_secs: u64,
    /// Comment authors whose suggestions are applied (case-insensitive substrings)
    pub bot_authors: Vec<String>,
    /// Syntax check run on each edited file; `{file}` is substituted
    pub syntax_check_command: Option<Vec<String>>,
    /// Delete the patch branch once its review merges
    pub delete_branch_on_merge: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            remote: "origin".to_string(),
            default_base_branch: "main".to_string(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            review: "gh".to_string(),
            install_commands: HashMap::new(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            protected_branches: vec![
                "main".to_string(),
                "master".to_string(),
                "develop".to_string(),
                "release/*".to_string(),
                "hotfix/*".to_string(),
            ],
            critical_files: vec![
                "patchkeeper.toml".to_string(),
                "Cargo.toml".to_string(),
                "Cargo.lock".to_string(),
                ".gitignore".to_string(),
                ".github/workflows/".to_string(),
            ],
            max_revision_age_days: 30,
        }
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            validated_marker: r"(?i)(\[validated\]|validated|tests? pass(ed)?|working state)".to_string(),
            emergency_scan_depth: 50,
            emergency_fallback_depth: 5,
            transient_directories: vec![
                "target".to_string(),
                "node_modules".to_string(),
                "__pycache__".to_string(),
                ".pytest_cache".to_string(),
                "coverage".to_string(),
                "dist".to_string(),
            ],
            // Kept inside .git so `git clean` and status checks never see them
            backup_dir: PathBuf::from(".git/patchkeeper/backups"),
            report_dir: PathBuf::from(".git/patchkeeper/reports"),
            required_files: Vec::new(),
            validation_command: None,
        }
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            commit_prefix: "patchkeeper:".to_string(),
            branch_prefix: "patch".to_string(),
            validation_command: None,
            lock_timeout_secs: 30,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            suggestion_budget_secs: 3600,     // 1 hour
            ticket_budget_secs: 7 * 24 * 3600, // 1 week
            bot_authors: vec!["[bot]".to_string(), "copilot".to_string()],
            syntax_check_command: None,
            delete_branch_on_merge: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`patchkeeper.toml` unless a path is given)
    /// 3. Environment variables (prefixed with PATCHKEEPER_, nested with `__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&EngineConfig::default())
            .context("Failed to serialize default configuration")?;
        let mut builder = Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new("patchkeeper.toml").exists() => {
                builder = builder.add_source(File::with_name("patchkeeper"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("PATCHKEEPER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let engine_config: EngineConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        engine_config.validate()?;
        Ok(engine_config)
    }

    /// Reject settings that would make components misbehave
    pub fn validate(&self) -> Result<()> {
        Regex::new(&self.rollback.validated_marker)
            .with_context(|| format!("Invalid validated_marker regex '{}'", self.rollback.validated_marker))?;
        if self.patch.commit_prefix.trim().is_empty() {
            anyhow::bail!("patch.commit_prefix must not be empty; it marks engine commits");
        }
        if self.monitor.poll_interval_secs == 0 {
            anyhow::bail!("monitor.poll_interval_secs must be positive");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Same configuration rooted at another working tree
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repository.root = root.into();
        self
    }

    /// Resolve a configured path against the project root
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.repository.root.join(relative)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn suggestion_budget(&self) -> Duration {
        Duration::from_secs(self.monitor.suggestion_budget_secs)
    }

    pub fn ticket_budget(&self) -> Duration {
        Duration::from_secs(self.monitor.ticket_budget_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.patch.lock_timeout_secs)
    }

    /// Whether `branch` matches any protected-branch pattern
    pub fn is_protected_branch(&self, branch: &str) -> bool {
        self.safety
            .protected_branches
            .iter()
            .any(|pattern| matches_pattern(pattern, branch))
    }

    /// Critical-file entries that `file` falls under
    pub fn critical_overlap(&self, file: &str) -> Option<&str> {
        let normalized = file.trim_start_matches("./").replace('\\', "/");
        self.safety
            .critical_files
            .iter()
            .find(|entry| {
                if entry.ends_with('/') {
                    normalized.starts_with(entry.as_str())
                } else {
                    normalized == **entry
                }
            })
            .map(String::as_str)
    }
}

/// Match a name against a pattern where `*` stands for any run of characters
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}
