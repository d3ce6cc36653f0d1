//! Configuration Vault – reads/writes `~/.cmvk/config.toml`.

use cmvk_runtime::{ArbiterConfig, FingerprintMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// Persisted user configuration stored in `~/.cmvk/config.toml`.
///
/// Model collaborators are used only when `base_url` is set; otherwise the
/// CLI falls back to the offline Null collaborators.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of an OpenAI-compatible chat API (e.g. a local Ollama at
    /// `http://localhost:11434`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_generator_model")]
    pub generator_model: String,

    /// Should differ from `generator_model`; the point of the kernel is that
    /// the reviewer does not share the author's blind spots.
    #[serde(default = "default_verifier_model")]
    pub verifier_model: String,

    /// API key sent as a bearer token.  Stored as plain text, so the file is
    /// written owner-only.
    #[serde(default, skip_serializing_if = "key_is_empty")]
    pub api_key: Zeroizing<String>,

    #[serde(default = "default_max_loops")]
    pub max_loops: u32,

    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,

    /// Episodes run at once by `cmvk run`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_timeout_secs")]
    pub generator_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub verifier_timeout_secs: u64,

    /// Wall-clock budget per episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_deadline_secs: Option<u64>,

    #[serde(default)]
    pub fingerprint_mode: FingerprintMode,

    #[serde(default = "default_true")]
    pub stop_on_repeated_dead_end: bool,

    /// Shared request budget for both model collaborators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_jsonl: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_db: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("generator_model", &self.generator_model)
            .field("verifier_model", &self.verifier_model)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("max_loops", &self.max_loops)
            .field("ban_threshold", &self.ban_threshold)
            .field("concurrency", &self.concurrency)
            .field("generator_timeout_secs", &self.generator_timeout_secs)
            .field("verifier_timeout_secs", &self.verifier_timeout_secs)
            .field("episode_deadline_secs", &self.episode_deadline_secs)
            .field("fingerprint_mode", &self.fingerprint_mode)
            .field("stop_on_repeated_dead_end", &self.stop_on_repeated_dead_end)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("trace_jsonl", &self.trace_jsonl)
            .field("trace_db", &self.trace_db)
            .finish()
    }
}

fn key_is_empty(key: &Zeroizing<String>) -> bool {
    key.is_empty()
}
fn default_generator_model() -> String {
    "qwen2.5-coder".to_string()
}
fn default_verifier_model() -> String {
    "llama3".to_string()
}
fn default_max_loops() -> u32 {
    5
}
fn default_ban_threshold() -> u32 {
    2
}
fn default_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            generator_model: default_generator_model(),
            verifier_model: default_verifier_model(),
            api_key: Zeroizing::default(),
            max_loops: default_max_loops(),
            ban_threshold: default_ban_threshold(),
            concurrency: default_concurrency(),
            generator_timeout_secs: default_timeout_secs(),
            verifier_timeout_secs: default_timeout_secs(),
            episode_deadline_secs: None,
            fingerprint_mode: FingerprintMode::default(),
            stop_on_repeated_dead_end: true,
            requests_per_minute: None,
            trace_jsonl: None,
            trace_db: None,
        }
    }
}

impl Config {
    /// Arbiter settings derived from this config.  Validation happens when
    /// the arbiter is built.
    pub fn to_arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            max_loops: self.max_loops,
            ban_threshold: self.ban_threshold,
            generator_timeout: Duration::from_secs(self.generator_timeout_secs),
            verifier_timeout: Duration::from_secs(self.verifier_timeout_secs),
            episode_deadline: self.episode_deadline_secs.map(Duration::from_secs),
            fingerprint_mode: self.fingerprint_mode,
            stop_on_repeated_dead_end: self.stop_on_repeated_dead_end,
        }
    }

    /// `true` when model collaborators are configured.
    pub fn uses_models(&self) -> bool {
        self.base_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Return the path to `~/.cmvk/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cmvk").join("config.toml")
}

/// Load the config at `path`, or the defaults when the file is absent.
/// Environment overrides apply either way.
pub fn load_or_default(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `CMVK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CMVK_BASE_URL` | `base_url` |
/// | `CMVK_GENERATOR_MODEL` | `generator_model` |
/// | `CMVK_VERIFIER_MODEL` | `verifier_model` |
/// | `CMVK_API_KEY` | `api_key` |
/// | `CMVK_MAX_LOOPS` | `max_loops` |
/// | `CMVK_BAN_THRESHOLD` | `ban_threshold` |
/// | `CMVK_CONCURRENCY` | `concurrency` |
/// | `CMVK_REQUESTS_PER_MINUTE` | `requests_per_minute` |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CMVK_BASE_URL") {
        cfg.base_url = Some(v);
    }
    if let Ok(v) = std::env::var("CMVK_GENERATOR_MODEL") {
        cfg.generator_model = v;
    }
    if let Ok(v) = std::env::var("CMVK_VERIFIER_MODEL") {
        cfg.verifier_model = v;
    }
    if let Ok(v) = std::env::var("CMVK_API_KEY") {
        cfg.api_key = Zeroizing::new(v);
    }
    if let Ok(v) = std::env::var("CMVK_MAX_LOOPS")
        && let Ok(n) = v.parse::<u32>() {
            cfg.max_loops = n;
        }
    if let Ok(v) = std::env::var("CMVK_BAN_THRESHOLD")
        && let Ok(n) = v.parse::<u32>() {
            cfg.ban_threshold = n;
        }
    if let Ok(v) = std::env::var("CMVK_CONCURRENCY")
        && let Ok(n) = v.parse::<usize>() {
            cfg.concurrency = n;
        }
    if let Ok(v) = std::env::var("CMVK_REQUESTS_PER_MINUTE")
        && let Ok(n) = v.parse::<u32>() {
            cfg.requests_per_minute = Some(n);
        }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Write the file with owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_debug_redacts_api_key() {
        let mut cfg = Config::default();
        cfg.api_key = Zeroizing::new("sk-secret-key".to_string());
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("sk-secret-key"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn config_debug_shows_not_set_for_empty_key() {
        let debug = format!("{:?}", Config::default());
        assert!(debug.contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmvk").join("config.toml");
        save_to(&Config::default(), &path).unwrap();

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file should be owner rw only");
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory should be owner rwx only");
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.base_url = Some("http://gpu-box:8000".into());
        cfg.api_key = Zeroizing::new("k".into());
        cfg.fingerprint_mode = FingerprintMode::Normalized;
        cfg.episode_deadline_secs = Some(300);
        save_to(&cfg, &path).unwrap();

        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.base_url.as_deref(), Some("http://gpu-box:8000"));
        assert_eq!(loaded.api_key.as_str(), "k");
        assert_eq!(loaded.fingerprint_mode, FingerprintMode::Normalized);
        assert_eq!(loaded.episode_deadline_secs, Some(300));
        assert_eq!(loaded.max_loops, 5);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_loops = 9\nfingerprint_mode = \"normalized\"\n").unwrap();
        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.max_loops, 9);
        assert_eq!(cfg.ban_threshold, 2);
        assert_eq!(cfg.fingerprint_mode, FingerprintMode::Normalized);
        assert!(cfg.stop_on_repeated_dead_end);
        assert!(!cfg.uses_models());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_loops = \"many\"").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_cmvk_dir() {
        let path = config_path_for_home("/home/dev");
        assert_eq!(path, PathBuf::from("/home/dev/.cmvk/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn arbiter_config_mirrors_fields() {
        let mut cfg = Config::default();
        cfg.max_loops = 3;
        cfg.verifier_timeout_secs = 5;
        cfg.episode_deadline_secs = Some(30);
        let arbiter = cfg.to_arbiter_config();
        assert_eq!(arbiter.max_loops, 3);
        assert_eq!(arbiter.ban_threshold, 2);
        assert_eq!(arbiter.verifier_timeout, Duration::from_secs(5));
        assert_eq!(arbiter.episode_deadline, Some(Duration::from_secs(30)));
        assert!(arbiter.validate().is_ok());
    }

    #[test]
    fn blank_base_url_means_offline() {
        let mut cfg = Config::default();
        cfg.base_url = Some("  ".into());
        assert!(!cfg.uses_models());
        cfg.base_url = Some("http://localhost:11434".into());
        assert!(cfg.uses_models());
    }

    #[test]
    fn apply_env_overrides_changes_base_url() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("CMVK_BASE_URL", "http://model-host:11434") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.base_url.as_deref(), Some("http://model-host:11434"));
        unsafe { std::env::remove_var("CMVK_BASE_URL") };
    }

    #[test]
    fn apply_env_overrides_changes_verifier_model() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("CMVK_VERIFIER_MODEL", "mistral") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.verifier_model, "mistral");
        unsafe { std::env::remove_var("CMVK_VERIFIER_MODEL") };
    }

    #[test]
    fn apply_env_overrides_changes_max_loops() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("CMVK_MAX_LOOPS", "12") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.max_loops, 12);
        unsafe { std::env::remove_var("CMVK_MAX_LOOPS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_threshold() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("CMVK_BAN_THRESHOLD", "two") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.ban_threshold, 2);
        unsafe { std::env::remove_var("CMVK_BAN_THRESHOLD") };
    }

    #[test]
    fn apply_env_overrides_sets_rate_limit() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("CMVK_REQUESTS_PER_MINUTE", "30") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.requests_per_minute, Some(30));
        unsafe { std::env::remove_var("CMVK_REQUESTS_PER_MINUTE") };
    }
}
