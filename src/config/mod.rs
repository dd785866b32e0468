use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const CONFIG_ARG: &str = "--config";
pub const LOCAL_CONFIG_FILE: &str = "ppp-broker.toml";
pub const HOME_CONFIG_FILE: &str = ".ppp-broker/config.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub heartbeat: HeartbeatConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub arbiter: ArbiterConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9870,
            tls_enabled: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct WireConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    pub sled: SledConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "sled".to_owned(),
            path: "~/.ppp-broker/data".to_owned(),
            sled: SledConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub ack_window_ms: u64,
    pub content_policy: String,
    pub content_ttl_ms: u64,
    pub recovery_policy: String,
    pub exit_when_idle: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ack_window_ms: 10_000,
            content_policy: "single_use".to_owned(),
            content_ttl_ms: 60_000,
            recovery_policy: "reprompt".to_owned(),
            exit_when_idle: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub default_decision: String,
    pub remember_decisions: bool,
    pub rules: Vec<ArbiterRuleConfig>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            default_decision: "deny".to_owned(),
            remember_decisions: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ArbiterRuleConfig {
    pub sender: String,
    pub operation: Option<String>,
    pub decision: String,
}

impl AppConfig {
    /// Resolves the config file (`--config`, then local, then home) and applies CLI overrides.
    /// Falls back to built-in defaults when no file is found.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, overrides) = split_config_arg(args)?;

        let path = match explicit_path {
            Some(path) => Some(path),
            None => discover_config_path(),
        };

        match path {
            Some(path) => Self::load_from_toml_with_args(path, overrides),
            None => Self::load_defaults_with_args(overrides),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        let mut root_value = defaults_value()?;
        merge_values(&mut root_value, file_value);
        apply_overrides_and_build(root_value, args)
    }

    pub fn load_defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        apply_overrides_and_build(defaults_value()?, args)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    SerializeDefaults(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::SerializeDefaults(source) => {
                write!(f, "failed to render built-in default config: {source}")
            }
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn defaults_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::SerializeDefaults)
}

fn apply_overrides_and_build(
    mut root_value: Value,
    args: impl IntoIterator<Item = String>,
) -> Result<AppConfig, ConfigError> {
    let overrides = parse_cli_overrides(args)?;
    for (key_path, raw_value) in overrides {
        apply_override(&mut root_value, &key_path, &raw_value)?;
    }

    root_value.try_into().map_err(ConfigError::Deserialize)
}

fn split_config_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut explicit = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_ARG {
            let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            explicit = Some(PathBuf::from(path));
            continue;
        }
        rest.push(arg);
    }

    Ok((explicit, rest))
}

fn discover_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }

    let home = std::env::var("HOME").ok()?;
    let in_home = PathBuf::from(home).join(HOME_CONFIG_FILE);
    in_home.is_file().then_some(in_home)
}

// Tables merge key by key; any other overlay value replaces the base value.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.is_empty() || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let final_key = parts[parts.len() - 1];
    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(final_key)
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ppp-broker-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    #[test]
    fn defaults_are_used_without_a_file() {
        let config =
            AppConfig::load_defaults_with_args(Vec::<String>::new()).expect("defaults should load");

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.broker.content_policy, "single_use");
        assert_eq!(config.arbiter.default_decision, "deny");
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"

[broker]
ack_window_ms = 2500

[[arbiter.rules]]
sender = "com.example.maps"
operation = "RequestLocationUpdates"
decision = "allow"
"#,
            "partial",
        );

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.broker.ack_window_ms, 2500);
        assert_eq!(config.broker.recovery_policy, "reprompt");
        assert_eq!(config.arbiter.rules.len(), 1);
        assert_eq!(
            config.arbiter.rules[0].operation.as_deref(),
            Some("RequestLocationUpdates")
        );
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let config = AppConfig::load_defaults_with_args(vec![
            "--logging.human_friendly".to_owned(),
            "true".to_owned(),
            "--broker.ack_window_ms".to_owned(),
            "750".to_owned(),
            "--storage.engine".to_owned(),
            "memory".to_owned(),
        ])
        .expect("config with overrides should load");

        assert!(config.logging.human_friendly);
        assert_eq!(config.broker.ack_window_ms, 750);
        assert_eq!(config.storage.engine, "memory");
    }

    #[test]
    fn explicit_config_arg_is_consumed_before_overrides() {
        let path = write_temp_config(
            r#"
[server]
port = 7001
"#,
            "explicit",
        );

        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
            "--server.host".to_owned(),
            "0.0.0.0".to_owned(),
        ])
        .expect("explicit config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.server.port, 7001);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--broker.nonexistent".to_owned(),
            "x".to_owned(),
        ])
        .expect_err("unknown override key should fail");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_mistyped_override_value() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--broker.exit_when_idle".to_owned(),
            "sometimes".to_owned(),
        ])
        .expect_err("non-boolean value should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "boolean",
                ..
            }
        ));
    }
}
