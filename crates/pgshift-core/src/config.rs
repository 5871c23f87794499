//! Configuration management for pgshift
//!
//! Configuration is loaded once from environment variables (falling back to a
//! `.env` file in the working directory) and then passed explicitly to every
//! component. Only [`Config::bootstrap_summary`] looks at the environment
//! again, to report where each value came from.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Version of the database engine this build runs when `PG_VERSION` is unset.
pub const DEFAULT_PG_VERSION: &str = "11";

/// Main configuration struct for pgshift
#[derive(Debug, Clone)]
pub struct Config {
    // Data directory
    pub data_dir: PathBuf,
    pub pg_subdir: String,
    /// Version the runtime expects to find on disk.
    pub pg_version: String,
    /// `PGHOST` / `PGDATASOURCE` point at a database we do not manage.
    pub external_database: bool,

    // Helper container
    pub helper_image_repo: String,
    /// Parent of `<version>/data` inside the helper image.
    pub helper_data_root: PathBuf,
    /// Working directory of the helper container; the scratch workspace is
    /// bound here.
    pub helper_workdir: PathBuf,
    pub docker_bin: String,

    // Environment probe
    pub container_id: Option<String>,
    pub cgroup_path: PathBuf,
    pub mountinfo_path: PathBuf,

    // Privileged operations
    pub db_system_user: String,
    pub privilege_wrapper: String,
    pub optimize_script: PathBuf,
    pub database_name: String,
    pub run_dir: PathBuf,

    // Logging
    pub verbose: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/opt/pgshift/data"),
            pg_subdir: "postgresql".to_string(),
            pg_version: DEFAULT_PG_VERSION.to_string(),
            external_database: false,
            helper_image_repo: "tianon/postgres-upgrade".to_string(),
            helper_data_root: PathBuf::from("/var/lib/postgresql"),
            helper_workdir: PathBuf::from("/tmp/upgrade"),
            docker_bin: "docker".to_string(),
            container_id: None,
            cgroup_path: PathBuf::from("/proc/self/cgroup"),
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
            db_system_user: "postgres".to_string(),
            privilege_wrapper: "su-exec".to_string(),
            optimize_script: PathBuf::from("/postgres-optimize.sh"),
            database_name: "app".to_string(),
            run_dir: PathBuf::from("/run/postgresql"),
            verbose: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Data directory
        if let Some(v) = env_value("DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.data_dir = PathBuf::from(shellexpand::tilde(v.trim()).into_owned());
        }
        if let Some(v) = env_value("PG_SUBDIR").filter(|v| !v.trim().is_empty()) {
            config.pg_subdir = v.trim().to_string();
        }
        if let Some(v) = env_value("PG_VERSION") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                config.pg_version = trimmed.to_string();
            }
        }
        config.external_database = ["PGHOST", "PGDATASOURCE"]
            .iter()
            .any(|key| env_value(key).is_some_and(|v| !v.is_empty()));

        // Helper container
        if let Some(v) = env_value("UPGRADE_HELPER_IMAGE") {
            config.helper_image_repo = v;
        }
        if let Some(v) = env_value("UPGRADE_HELPER_DATA_ROOT") {
            config.helper_data_root = PathBuf::from(v);
        }
        if let Some(v) = env_value("UPGRADE_HELPER_WORKDIR") {
            config.helper_workdir = PathBuf::from(v);
        }
        if let Some(v) = env_value("DOCKER_BIN") {
            config.docker_bin = v;
        }

        // Environment probe
        config.container_id = env_value("CONTAINER_ID")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(v) = env_value("PROC_CGROUP_PATH") {
            config.cgroup_path = PathBuf::from(v);
        }
        if let Some(v) = env_value("PROC_MOUNTINFO_PATH") {
            config.mountinfo_path = PathBuf::from(v);
        }

        // Privileged operations
        if let Some(v) = env_value("PG_SYSTEM_USER") {
            config.db_system_user = v;
        }
        if let Some(v) = env_value("PRIVILEGE_WRAPPER") {
            config.privilege_wrapper = v;
        }
        if let Some(v) = env_value("PG_OPTIMIZE_SCRIPT") {
            config.optimize_script = PathBuf::from(v);
        }
        if let Some(v) = env_value("PG_DATABASE_NAME") {
            config.database_name = v;
        }
        if let Some(v) = env_value("PG_RUN_DIR") {
            config.run_dir = PathBuf::from(v);
        }

        // Logging
        config.verbose = env_bool("VERBOSE", config.verbose);
        if let Some(v) = env_value("LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }

    /// The managed data directory, e.g. `/var/opt/pgshift/data/postgresql`.
    #[must_use]
    pub fn pg_data_path(&self) -> PathBuf {
        self.data_dir.join(&self.pg_subdir)
    }

    /// Build a startup summary showing resolved config and sources.
    #[must_use]
    pub fn bootstrap_summary(&self) -> BootstrapSummary {
        let line = |key: &'static str, value: String, env_key: &str| BootstrapLine {
            key,
            value,
            source: detect_source(env_key),
        };
        let lines = vec![
            line("data", self.pg_data_path().display().to_string(), "DATA_DIR"),
            line("version", self.pg_version.clone(), "PG_VERSION"),
            line(
                "external",
                self.external_database.to_string(),
                if env_value("PGHOST").is_some() {
                    "PGHOST"
                } else {
                    "PGDATASOURCE"
                },
            ),
            line("image", self.helper_image_repo.clone(), "UPGRADE_HELPER_IMAGE"),
            line("docker", self.docker_bin.clone(), "DOCKER_BIN"),
            line(
                "container",
                self.container_id
                    .clone()
                    .unwrap_or_else(|| format!("(probe {})", self.cgroup_path.display())),
                "CONTAINER_ID",
            ),
            line("db-user", self.db_system_user.clone(), "PG_SYSTEM_USER"),
            line("verbose", self.verbose.to_string(), "VERBOSE"),
        ];
        BootstrapSummary { lines }
    }
}

/// Where a configuration value was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Process environment variable.
    ProcessEnv,
    /// Project-local `.env` file in working directory.
    ProjectDotenv,
    /// CLI argument override.
    CliArg,
    /// Hardcoded default.
    Default,
}

impl ConfigSource {
    /// Short label for terminal display.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ProcessEnv => "env",
            Self::ProjectDotenv => ".env",
            Self::CliArg => "cli",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One line in the startup summary.
#[derive(Debug, Clone)]
pub struct BootstrapLine {
    pub key: &'static str,
    pub value: String,
    pub source: ConfigSource,
}

/// Startup summary showing resolved config sources.
#[derive(Debug, Clone)]
pub struct BootstrapSummary {
    pub lines: Vec<BootstrapLine>,
}

impl BootstrapSummary {
    /// Set value and source for a given key.
    pub fn set(&mut self, key: &str, value: String, source: ConfigSource) {
        if let Some(line) = self.lines.iter_mut().find(|l| l.key == key) {
            line.value = value;
            line.source = source;
        }
    }

    /// Format as a compact tree for terminal display.
    #[must_use]
    pub fn format(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "  pgshift: effective configuration");
        let last_idx = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let connector = if i == last_idx {
                "\u{2514}\u{2500}"
            } else {
                "\u{251c}\u{2500}"
            };
            let _ = writeln!(
                out,
                "  {connector} {:<10} {} ({})",
                format!("{}:", line.key),
                line.value,
                line.source.label(),
            );
        }
        out
    }
}

/// Determine which layer supplies `key`.
#[must_use]
pub fn detect_source(key: &str) -> ConfigSource {
    #[cfg(test)]
    if test_env_override_value(key).is_some() {
        return ConfigSource::ProcessEnv;
    }
    if env::var_os(key).is_some() {
        ConfigSource::ProcessEnv
    } else if dotenv_value(key).is_some() {
        ConfigSource::ProjectDotenv
    } else {
        ConfigSource::Default
    }
}

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<HashMap<String, String>> =
        std::cell::RefCell::new(HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| load_dotenv_file(Path::new(".env")))
}

/// Read a value from the .env file (if present).
#[must_use]
pub fn dotenv_value(key: &str) -> Option<String> {
    dotenv_values().get(key).cloned()
}

/// Read a value from the real environment first, falling back to .env.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    #[cfg(test)]
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    env::var(key).ok().or_else(|| dotenv_value(key))
}

fn load_dotenv_file(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    let values = parse_dotenv_contents(&contents);
    tracing::debug!(path = %path.display(), keys = values.len(), "loaded .env");
    values
}

/// Parse `KEY=value` lines, ignoring comments and an optional `export ` prefix.
#[must_use]
pub fn parse_dotenv_contents(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }
    map
}

fn strip_quotes(raw: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    raw
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        other => {
            tracing::warn!(value = other, "unrecognized boolean, using default {default}");
            default
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_value(key).map_or(default, |v| parse_bool(&v, default))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestEnvOverrideGuard {
        previous: Vec<(String, Option<String>)>,
    }

    impl TestEnvOverrideGuard {
        fn set(vars: &[(&str, &str)]) -> Self {
            let mut previous = Vec::new();
            TEST_ENV_OVERRIDES.with(|cell| {
                let mut map = cell.borrow_mut();
                for (key, value) in vars {
                    let old = map.get(*key).cloned();
                    previous.push(((*key).to_string(), old));
                    map.insert((*key).to_string(), (*value).to_string());
                }
            });
            Self { previous }
        }
    }

    impl Drop for TestEnvOverrideGuard {
        fn drop(&mut self) {
            TEST_ENV_OVERRIDES.with(|cell| {
                let mut map = cell.borrow_mut();
                for (key, value) in self.previous.drain(..) {
                    match value {
                        Some(v) => {
                            map.insert(key, v);
                        }
                        None => {
                            map.remove(&key);
                        }
                    }
                }
            });
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pg_version, "11");
        assert_eq!(
            config.pg_data_path(),
            PathBuf::from("/var/opt/pgshift/data/postgresql")
        );
        assert!(!config.verbose);
        assert!(config.container_id.is_none());
    }

    #[test]
    fn pg_version_is_trimmed_and_blank_falls_back() {
        {
            let _guard = TestEnvOverrideGuard::set(&[("PG_VERSION", " 12 \n")]);
            assert_eq!(Config::from_env().pg_version, "12");
        }
        let _guard = TestEnvOverrideGuard::set(&[("PG_VERSION", "   ")]);
        assert_eq!(Config::from_env().pg_version, DEFAULT_PG_VERSION);
    }

    #[test]
    fn external_database_detected_from_pghost() {
        let _guard = TestEnvOverrideGuard::set(&[("PGHOST", "db.internal")]);
        assert!(Config::from_env().external_database);
    }

    #[test]
    fn verbose_accepts_common_truthy_values() {
        for value in ["1", "true", "YES", "y"] {
            let _guard = TestEnvOverrideGuard::set(&[("VERBOSE", value)]);
            assert!(Config::from_env().verbose, "{value} should enable verbose");
        }
        let _guard = TestEnvOverrideGuard::set(&[("VERBOSE", "maybe")]);
        assert!(!Config::from_env().verbose);
    }

    #[test]
    fn blank_container_id_is_ignored() {
        let _guard = TestEnvOverrideGuard::set(&[("CONTAINER_ID", "  ")]);
        assert!(Config::from_env().container_id.is_none());
    }

    #[test]
    fn dotenv_parsing_handles_export_quotes_and_comments() {
        let parsed = parse_dotenv_contents(
            "# comment\nexport DATA_DIR=\"/srv/data\"\nPG_VERSION='12'\n\nBROKEN\nVERBOSE=1\n",
        );
        assert_eq!(parsed.get("DATA_DIR").map(String::as_str), Some("/srv/data"));
        assert_eq!(parsed.get("PG_VERSION").map(String::as_str), Some("12"));
        assert_eq!(parsed.get("VERBOSE").map(String::as_str), Some("1"));
        assert!(!parsed.contains_key("BROKEN"));
    }

    #[test]
    fn bootstrap_summary_marks_env_sources() {
        let _guard = TestEnvOverrideGuard::set(&[("PG_VERSION", "12")]);
        let config = Config::from_env();
        let summary = config.bootstrap_summary();
        let version = summary
            .lines
            .iter()
            .find(|l| l.key == "version")
            .expect("version line");
        assert_eq!(version.value, "12");
        assert_eq!(version.source, ConfigSource::ProcessEnv);
        assert!(summary.format().contains("version:"));
    }
}
