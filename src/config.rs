//! Configuration for the TTN MQTT client
//!
//! Two layers live here:
//!
//! - [`ConnectionConfig`] is the immutable value handed to
//!   [`ConnectionManager::connect`](crate::transport::mqtt::ConnectionManager::connect).
//! - [`ClientConfig`] is the TOML file shape used by the binary. It resolves the
//!   access key from an environment variable so secrets stay out of the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Characters that carry meaning inside MQTT topic filters
const TOPIC_RESERVED_CHARS: [char; 3] = ['/', '+', '#'];

/// Account identifiers needed to reach one TTN application
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Handler region, e.g. `eu`, `us-west`, `asia-se`
    pub region: String,
    /// TTN application id, used as the MQTT username
    pub application_id: String,
    /// Application access key, used as the MQTT password
    pub access_key: String,
    /// Restrict traffic to a single device; `None` or empty means all devices
    #[serde(default)]
    pub device_id: Option<String>,
}

impl ConnectionConfig {
    pub fn new(
        region: impl Into<String>,
        application_id: impl Into<String>,
        access_key: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            region: region.into(),
            application_id: application_id.into(),
            access_key: access_key.into(),
            device_id,
        }
    }

    /// Device id with `None` folded into the empty string
    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or("")
    }

    /// Check that every required identifier is present and usable inside a topic
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_identifier("region", &self.region)?;
        require_identifier("application_id", &self.application_id)?;
        if self.access_key.is_empty() {
            return Err(ConfigError::MissingField("access_key"));
        }
        if let Some(device_id) = self.device_id.as_deref() {
            if !device_id.is_empty() {
                check_topic_safe("device_id", device_id)?;
            }
        }
        Ok(())
    }
}

// The access key never shows up in logs or panics.
impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("region", &self.region)
            .field("application_id", &self.application_id)
            .field("access_key", &"***")
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn require_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    check_topic_safe(field, value)
}

fn check_topic_safe(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if let Some(ch) = value.chars().find(|c| TOPIC_RESERVED_CHARS.contains(c)) {
        return Err(ConfigError::InvalidIdentifier {
            field,
            reason: format!("'{value}' contains reserved character '{ch}'"),
        });
    }
    Ok(())
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub ttn: TtnSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// `[ttn]` section: the account identifiers
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TtnSection {
    pub region: String,
    pub application_id: String,
    /// Inline access key; takes precedence over `access_key_env`
    pub access_key: Option<String>,
    /// Environment variable holding the access key
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    pub device_id: Option<String>,
}

impl std::fmt::Debug for TtnSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtnSection")
            .field("region", &self.region)
            .field("application_id", &self.application_id)
            .field("access_key", &self.access_key.as_ref().map(|_| "***"))
            .field("access_key_env", &self.access_key_env)
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn default_access_key_env() -> String {
    "TTN_ACCESS_KEY".to_string()
}

/// `[mqtt]` section: transport knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Override for the derived broker URL (local brokers, tests)
    pub broker_url: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

fn default_keep_alive() -> u64 {
    30
}

/// `[reconnect]` section: automatic reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Give up after this many consecutive failed attempts (absent = never)
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000]
}

fn default_sustained_delay() -> u64 {
    128_000
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid {field}: {reason}")]
    InvalidIdentifier { field: &'static str, reason: String },
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve the access key: inline value first, then the environment
    pub fn access_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.ttn.access_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        std::env::var(&self.ttn.access_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.ttn.access_key_env.clone()))
    }

    /// Build the immutable connection value, validated
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let config = ConnectionConfig::new(
            self.ttn.region.clone(),
            self.ttn.application_id.clone(),
            self.access_key()?,
            self.ttn.device_id.clone(),
        );
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> ConnectionConfig {
        ConnectionConfig::new("eu", "my-app", "ttn-account-v2.secret", None)
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(valid().validate().is_ok());

        let mut with_device = valid();
        with_device.device_id = Some("node-1".to_string());
        assert!(with_device.validate().is_ok());

        let mut empty_device = valid();
        empty_device.device_id = Some(String::new());
        assert!(empty_device.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut config = valid();
        config.region.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("region"))
        ));

        let mut config = valid();
        config.application_id.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("application_id"))
        ));

        let mut config = valid();
        config.access_key.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("access_key"))
        ));
    }

    #[test]
    fn test_validate_rejects_topic_characters() {
        let mut config = valid();
        config.application_id = "my/app".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdentifier {
                field: "application_id",
                ..
            })
        ));

        let mut config = valid();
        config.device_id = Some("node+1".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdentifier {
                field: "device_id",
                ..
            })
        ));
    }

    #[test]
    fn test_debug_hides_access_key() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_full_config_file() {
        let toml_content = r#"
[ttn]
region = "eu"
application_id = "my-app"
access_key = "inline-key"
device_id = "node-1"

[mqtt]
broker_url = "tcp://localhost:1883"
keep_alive_secs = 15

[reconnect]
max_attempts = 5
backoff_pattern_ms = [100, 200]
sustained_delay_ms = 500
"#;
        let config = ClientConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.ttn.region, "eu");
        assert_eq!(config.mqtt.broker_url.as_deref(), Some("tcp://localhost:1883"));
        assert_eq!(config.mqtt.keep_alive_secs, 15);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.backoff_pattern_ms, vec![100, 200]);

        let connection = config.connection_config().unwrap();
        assert_eq!(connection.access_key, "inline-key");
        assert_eq!(connection.device_id(), "node-1");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[ttn]
region = "eu"
application_id = "my-app"
"#;
        let config = ClientConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.ttn.access_key_env, "TTN_ACCESS_KEY");
        assert_eq!(config.mqtt, MqttSection::default());
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.reconnect, ReconnectSection::default());
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_access_key_from_environment() {
        let toml_content = r#"
[ttn]
region = "eu"
application_id = "my-app"
access_key_env = "TTN_MQTT_TEST_ACCESS_KEY_PRESENT"
"#;
        std::env::set_var("TTN_MQTT_TEST_ACCESS_KEY_PRESENT", "from-env");
        let config = ClientConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.access_key().unwrap(), "from-env");
        std::env::remove_var("TTN_MQTT_TEST_ACCESS_KEY_PRESENT");
    }

    #[test]
    fn test_missing_access_key_env() {
        let toml_content = r#"
[ttn]
region = "eu"
application_id = "my-app"
access_key_env = "TTN_MQTT_TEST_ACCESS_KEY_ABSENT"
"#;
        let config = ClientConfig::from_toml_str(toml_content).unwrap();
        assert!(matches!(
            config.connection_config(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "TTN_MQTT_TEST_ACCESS_KEY_ABSENT"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ttn]\nregion = \"us-west\"\napplication_id = \"app\"\naccess_key = \"k\""
        )
        .unwrap();

        let config = ClientConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.ttn.region, "us-west");
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientConfig::load_from_file(Path::new("/nonexistent/ttn.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let result = ClientConfig::from_toml_str("[ttn\nregion = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
