//! Configuration for the forwarder
//!
//! Values come from environment variables (a `.env` file is loaded first) and
//! optionally from a flat `config.yml`. Environment variables take precedence
//! over YAML values, and YAML strings of the form `${VAR}` resolve from the
//! environment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default constants
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";
pub const DEFAULT_STATE_FILE: &str = ".state.json";
pub const DEFAULT_SESSION_FILE: &str = "sessions/forwarder.session";
pub const DEFAULT_MEDIA_DIR: &str = "media";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HTTP_MAX_RETRIES: u32 = 5;
pub const DEFAULT_HTTP_BACKOFF_SECS: u64 = 2;
pub const DEFAULT_MEDIA_MAX_MB: u64 = 20;
pub const DEFAULT_ALBUM_DEBOUNCE_SECS: f64 = 2.0;
pub const DEFAULT_RESTART_COOLDOWN_SECS: u64 = 5;
pub const DEFAULT_BACKFILL_DELAY_SECS: f64 = 3.0;

/// Where channel cursors are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    /// JSON file rewritten on every update
    File,
    /// Process memory only, lost on restart
    Memory,
}

impl FromStr for StateBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" | "json" => Ok(StateBackend::File),
            "memory" | "mem" => Ok(StateBackend::Memory),
            other => Err(Error::Config(format!("unknown STATE_BACKEND '{}'", other))),
        }
    }
}

/// How media reaches the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSendMode {
    /// Files are downloaded and uploaded as multipart/form-data
    Multipart,
    /// Only a media flag and count are sent
    Reference,
}

impl FromStr for MediaSendMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "multipart" => Ok(MediaSendMode::Multipart),
            "reference" | "url" | "none" => Ok(MediaSendMode::Reference),
            other => Err(Error::Config(format!("unknown MEDIA_SEND_MODE '{}'", other))),
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub api_id: i32,
    pub api_hash: String,
    pub phone: String,
    pub channels: Vec<String>,
    pub webhook_url: String,
    pub http_timeout: Duration,
    pub http_max_retries: u32,
    pub http_backoff: Duration,
    pub log_level: String,
    pub state_backend: StateBackend,
    pub state_file: PathBuf,
    pub thread_message_id: Option<i32>,
    pub media_download: bool,
    pub media_dir: PathBuf,
    pub media_max_mb: u64,
    pub media_send_mode: MediaSendMode,
    pub album_debounce: Duration,
    pub session_file: PathBuf,
    pub restart_cooldown: Duration,
}

impl Config {
    /// Load configuration from `.env`, the optional YAML file and the environment.
    pub fn load() -> Result<Self> {
        Self::load_dotenv();

        let yaml_path = std::env::var("FORWARDER_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let yaml = if Path::new(&yaml_path).exists() {
            load_yaml_values(&yaml_path)?
        } else {
            HashMap::new()
        };

        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| yaml.get(key).cloned())
        })
    }

    /// Load .env file into environment variables using dotenvy
    fn load_dotenv() {
        if dotenvy::dotenv().is_err() {
            let _ = dotenvy::from_filename("../.env");
        }
    }

    /// Build a config from any key lookup. Keys are the environment variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| {
            get(key)
                .ok_or_else(|| Error::Config(format!("Environment variable {} is required", key)))
        };

        let channels = parse_channels(&require("TG_CHANNELS")?);
        if channels.is_empty() {
            return Err(Error::Config("TG_CHANNELS contains no channels".to_string()));
        }

        let api_id = parse_value::<i32>("TG_API_ID", &require("TG_API_ID")?)?;
        let thread_message_id = get("THREAD_MESSAGE_ID")
            .map(|v| parse_value::<i32>("THREAD_MESSAGE_ID", &v))
            .transpose()?;

        let album_debounce_secs =
            parse_or(&get, "ALBUM_DEBOUNCE_SEC", DEFAULT_ALBUM_DEBOUNCE_SECS)?;
        if !album_debounce_secs.is_finite() || album_debounce_secs < 0.0 {
            return Err(Error::Config(
                "ALBUM_DEBOUNCE_SEC must be a non-negative number".to_string(),
            ));
        }

        Ok(Self {
            api_id,
            api_hash: require("TG_API_HASH")?,
            phone: get("TG_PHONE").unwrap_or_default(),
            channels,
            webhook_url: require("N8N_WEBHOOK_URL")?,
            http_timeout: Duration::from_secs(parse_or(
                &get,
                "HTTP_TIMEOUT",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
            http_max_retries: parse_or(&get, "HTTP_MAX_RETRIES", DEFAULT_HTTP_MAX_RETRIES)?,
            http_backoff: Duration::from_secs(parse_or(
                &get,
                "HTTP_BACKOFF_SECONDS",
                DEFAULT_HTTP_BACKOFF_SECS,
            )?),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            state_backend: get("STATE_BACKEND")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(StateBackend::File),
            state_file: get("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            thread_message_id,
            media_download: get("MEDIA_DOWNLOAD")
                .map(|v| parse_bool("MEDIA_DOWNLOAD", &v))
                .transpose()?
                .unwrap_or(false),
            media_dir: get("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR)),
            media_max_mb: parse_or(&get, "MEDIA_MAX_MB", DEFAULT_MEDIA_MAX_MB)?,
            media_send_mode: get("MEDIA_SEND_MODE")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(MediaSendMode::Multipart),
            album_debounce: Duration::from_secs_f64(album_debounce_secs),
            session_file: get("SESSION_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_FILE)),
            restart_cooldown: Duration::from_secs(parse_or(
                &get,
                "RESTART_COOLDOWN_SEC",
                DEFAULT_RESTART_COOLDOWN_SECS,
            )?),
        })
    }

    /// Media bytes are fetched only in multipart mode with downloads enabled.
    pub fn fetches_media(&self) -> bool {
        self.media_download && self.media_send_mode == MediaSendMode::Multipart
    }

    /// Lock file guarding the session, next to the session file.
    pub fn lock_file(&self) -> PathBuf {
        self.session_file.with_extension("lock")
    }
}

/// Split a comma-separated channel list, dropping `@` prefixes and blanks.
pub fn parse_channels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|c| c.trim().trim_start_matches('@').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| Error::Config(format!("{} has an invalid value '{}'", key, raw)))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{} has an invalid value '{}'", key, raw))),
    }
}

/// Read a flat YAML mapping into uppercase keys. Sequences become comma lists.
fn load_yaml_values<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let content = fs::read_to_string(path.as_ref())?;
    parse_yaml_values(&content)
}

fn parse_yaml_values(content: &str) -> Result<HashMap<String, String>> {
    let mapping: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(content)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

    let mut values = HashMap::new();
    for (key, value) in mapping {
        if let Some(text) = yaml_scalar(&value) {
            values.insert(key.to_uppercase(), resolve_env_string(&text));
        }
    }
    Ok(values)
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Sequence(items) => Some(
            items
                .iter()
                .filter_map(yaml_scalar)
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => None,
    }
}

/// Resolve `${VAR}` placeholders from the environment.
fn resolve_env_string(value: &str) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        return std::env::var(var_name).unwrap_or_default();
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(value) => std::env::set_var(&self.key, value),
                None => std::env::remove_var(&self.key),
            }
        }
    }

    fn base_vars() -> HashMap<String, String> {
        [
            ("TG_API_ID", "12345"),
            ("TG_API_HASH", "hash"),
            ("TG_CHANNELS", "@news, tech ,"),
            ("N8N_WEBHOOK_URL", "http://localhost:5678/webhook/tg"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn config_from(vars: &HashMap<String, String>) -> Result<Config> {
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn from_lookup_applies_defaults() {
        let cfg = config_from(&base_vars()).unwrap();
        assert_eq!(cfg.api_id, 12345);
        assert_eq!(cfg.channels, vec!["news", "tech"]);
        assert_eq!(cfg.http_timeout, Duration::from_secs(10));
        assert_eq!(cfg.http_max_retries, 5);
        assert_eq!(cfg.http_backoff, Duration::from_secs(2));
        assert_eq!(cfg.state_backend, StateBackend::File);
        assert_eq!(cfg.state_file, PathBuf::from(".state.json"));
        assert_eq!(cfg.thread_message_id, None);
        assert!(!cfg.media_download);
        assert_eq!(cfg.media_max_mb, 20);
        assert_eq!(cfg.media_send_mode, MediaSendMode::Multipart);
        assert_eq!(cfg.album_debounce, Duration::from_secs(2));
        assert_eq!(cfg.restart_cooldown, Duration::from_secs(5));
    }

    #[test]
    fn missing_required_value_fails_fast() {
        for key in ["TG_API_ID", "TG_API_HASH", "TG_CHANNELS", "N8N_WEBHOOK_URL"] {
            let mut vars = base_vars();
            vars.remove(key);
            let err = config_from(&vars).unwrap_err();
            assert!(err.to_string().contains(key), "{} not reported: {}", key, err);
        }
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut vars = base_vars();
        vars.insert("HTTP_MAX_RETRIES".into(), "many".into());
        assert!(matches!(config_from(&vars), Err(Error::Config(_))));

        let mut vars = base_vars();
        vars.insert("ALBUM_DEBOUNCE_SEC".into(), "-1".into());
        assert!(matches!(config_from(&vars), Err(Error::Config(_))));
    }

    #[test]
    fn empty_channel_list_is_rejected() {
        let mut vars = base_vars();
        vars.insert("TG_CHANNELS".into(), " , @ ,".into());
        assert!(config_from(&vars).is_err());
    }

    #[test]
    fn optional_values_are_parsed() {
        let mut vars = base_vars();
        vars.insert("THREAD_MESSAGE_ID".into(), "777".into());
        vars.insert("MEDIA_DOWNLOAD".into(), "yes".into());
        vars.insert("MEDIA_SEND_MODE".into(), "reference".into());
        vars.insert("STATE_BACKEND".into(), "memory".into());
        vars.insert("ALBUM_DEBOUNCE_SEC".into(), "0.5".into());

        let cfg = config_from(&vars).unwrap();
        assert_eq!(cfg.thread_message_id, Some(777));
        assert!(cfg.media_download);
        assert_eq!(cfg.media_send_mode, MediaSendMode::Reference);
        assert_eq!(cfg.state_backend, StateBackend::Memory);
        assert_eq!(cfg.album_debounce, Duration::from_millis(500));
        assert!(!cfg.fetches_media());
    }

    #[test]
    fn unknown_backend_is_a_config_error() {
        assert!("redis".parse::<StateBackend>().is_err());
        assert!("inline".parse::<MediaSendMode>().is_err());
    }

    #[test]
    fn yaml_values_flatten_lists_and_resolve_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _hash = EnvGuard::set("FORWARDER_TEST_HASH", "from_env");

        let yaml = r#"
tg_api_id: 42
tg_api_hash: "${FORWARDER_TEST_HASH}"
tg_channels:
  - news
  - "@tech"
media_download: true
"#;
        let values = parse_yaml_values(yaml).unwrap();
        assert_eq!(values.get("TG_API_ID").map(String::as_str), Some("42"));
        assert_eq!(values.get("TG_API_HASH").map(String::as_str), Some("from_env"));
        assert_eq!(values.get("MEDIA_DOWNLOAD").map(String::as_str), Some("true"));

        let channels = parse_channels(values.get("TG_CHANNELS").unwrap());
        assert_eq!(channels, vec!["news", "tech"]);
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = parse_yaml_values("tg_channels: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn lock_file_sits_next_to_session() {
        let cfg = config_from(&base_vars()).unwrap();
        assert_eq!(cfg.lock_file(), PathBuf::from("sessions/forwarder.lock"));
    }
}
