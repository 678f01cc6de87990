//! Configuration
//!
//! Settings are layered with figment, later layers winning:
//! 1. built-in defaults
//! 2. the TOML file (`freebas.toml` unless `--config` names another)
//! 3. `FREEBAS_` environment variables, nested keys split on `__`
//!    (e.g. `FREEBAS_HTTP__PORT=8080`)
//! 4. command-line flags that were given

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bacnet::MAX_INSTANCE;

pub const DEFAULT_CONFIG_FILE: &str = "freebas.toml";
pub const CERTIFICATE_FILE: &str = "certificate.pem";
pub const PRIVATE_KEY_FILE: &str = "private.key";

/// FreeBAS occupancy server
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "freebas", version)]
#[command(about = "BACnet/IP device publishing schedule occupancy and outside air temperature", long_about = None)]
pub struct Args {
    /// Configuration file (default: ./freebas.toml, if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP port
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Serve HTTPS with the certificate in --certs-dir
    #[arg(long)]
    pub tls: bool,

    /// Directory holding certificate.pem and private.key
    #[arg(long)]
    pub certs_dir: Option<PathBuf>,

    /// Schedule file
    #[arg(long)]
    pub schedule: Option<PathBuf>,

    /// BACnet/IP bind address
    #[arg(long)]
    pub bacnet_interface: Option<String>,

    /// BACnet/IP UDP port
    #[arg(long)]
    pub bacnet_port: Option<u16>,

    /// Device object instance number
    #[arg(long)]
    pub device_instance: Option<u32>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    /// The flags that were actually given, shaped like [`AppConfig`]
    fn overrides(&self) -> Value {
        let mut http = Map::new();
        if let Some(host) = &self.host {
            http.insert("host".into(), host.as_str().into());
        }
        if let Some(port) = self.port {
            http.insert("port".into(), port.into());
        }
        if self.tls {
            http.insert("tls".into(), true.into());
        }
        if let Some(dir) = &self.certs_dir {
            http.insert("certs_dir".into(), dir.display().to_string().into());
        }

        let mut bacnet = Map::new();
        if let Some(interface) = &self.bacnet_interface {
            bacnet.insert("interface".into(), interface.as_str().into());
        }
        if let Some(port) = self.bacnet_port {
            bacnet.insert("port".into(), port.into());
        }
        if let Some(instance) = self.device_instance {
            bacnet.insert("device_instance".into(), instance.into());
        }

        let mut root = Map::new();
        if !http.is_empty() {
            root.insert("http".into(), Value::Object(http));
        }
        if !bacnet.is_empty() {
            root.insert("bacnet".into(), Value::Object(bacnet));
        }
        if let Some(level) = &self.log_level {
            root.insert("log_level".into(), level.as_str().into());
        }
        if let Some(path) = &self.schedule {
            let schedule = Map::from_iter([("path".to_string(), Value::from(path.display().to_string()))]);
            root.insert("schedule".into(), Value::Object(schedule));
        }
        Value::Object(root)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] Box<figment::Error>),

    #[error("config file {0} not found")]
    MissingFile(PathBuf),

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("device instance {0} is out of range")]
    InvalidDeviceInstance(u32),

    #[error("TLS is enabled but {0} does not exist")]
    MissingTlsFile(PathBuf),

    #[error("sync interval must be at least 1 ms")]
    ZeroSyncInterval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub http: HttpConfig,
    pub schedule: ScheduleConfig,
    pub bacnet: BacnetConfig,
    pub weather: WeatherConfig,
    pub sync: SyncConfig,
    pub users: Vec<UserConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            http: HttpConfig::default(),
            schedule: ScheduleConfig::default(),
            bacnet: BacnetConfig::default(),
            weather: WeatherConfig::default(),
            sync: SyncConfig::default(),
            users: vec![UserConfig {
                username: "admin".to_string(),
                password: "admin".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub certs_dir: PathBuf,
    /// Idle lifetime of a login session
    pub session_ttl_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            tls: false,
            certs_dir: PathBuf::from("certs"),
            session_ttl_secs: 8 * 60 * 60,
        }
    }
}

impl HttpConfig {
    /// Certificate and private key paths
    pub fn tls_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.certs_dir.join(CERTIFICATE_FILE),
            self.certs_dir.join(PRIVATE_KEY_FILE),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub path: PathBuf,
    /// IANA zone the schedule is written in, host local time when unset
    pub timezone: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("schedule.json"),
            timezone: None,
        }
    }
}

impl ScheduleConfig {
    pub fn tz(&self) -> Result<Option<Tz>, ConfigError> {
        self.timezone
            .as_deref()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacnetConfig {
    pub interface: String,
    pub port: u16,
    /// Defaults to 255.255.255.255
    pub broadcast: Option<String>,
    pub device_instance: u32,
    pub device_name: String,
    pub vendor_identifier: u32,
    pub vendor_name: String,
    pub model_name: String,
    pub description: String,
    pub location: String,
    pub request_timeout_ms: u64,
    pub who_is_window_ms: u64,
}

impl Default for BacnetConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 47808,
            broadcast: None,
            device_instance: 999,
            device_name: "FreeBAS".to_string(),
            vendor_identifier: 999,
            vendor_name: "FreeBAS".to_string(),
            model_name: "freebas".to_string(),
            description: "Schedule occupancy and outside air temperature".to_string(),
            location: String::new(),
            request_timeout_ms: 3000,
            who_is_window_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timeout_secs: u64,
    /// How long a good reading is reused before asking again
    pub cache_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            url: "https://api.open-meteo.com/v1/forecast".to_string(),
            latitude: 44.98,
            longitude: -93.27,
            timeout_secs: 5,
            cache_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_ms: u64,
    /// Temperature present value when no reading is available
    pub temperature_fallback: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            temperature_fallback: -555.5,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl AppConfig {
    /// Build the effective configuration from every layer
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) if !path.exists() => return Err(ConfigError::MissingFile(path.clone())),
            Some(path) => path.clone(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config: AppConfig = Self::figment(&file)
            .merge(Serialized::defaults(args.overrides()))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("FREEBAS_").split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.tz()?;

        if self.bacnet.device_instance >= MAX_INSTANCE {
            return Err(ConfigError::InvalidDeviceInstance(self.bacnet.device_instance));
        }

        if self.sync.interval_ms == 0 {
            return Err(ConfigError::ZeroSyncInterval);
        }

        if self.http.tls {
            let (cert, key) = self.http.tls_paths();
            for path in [cert, key] {
                if !path.exists() {
                    return Err(ConfigError::MissingTlsFile(path));
                }
            }
        }
        Ok(())
    }

    /// Effective settings for the config view, passwords left out
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(users) = value.get_mut("users").and_then(Value::as_array_mut) {
            for user in users {
                if let Some(user) = user.as_object_mut() {
                    user.remove("password");
                }
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::load(&Args::default()).unwrap();
            assert_eq!(config, AppConfig::default());
            assert_eq!(config.http.port, 8000);
            assert_eq!(config.bacnet.port, 47808);
            assert_eq!(config.bacnet.device_instance, 999);
            assert_eq!(config.sync.temperature_fallback, -555.5);
            Ok(())
        });
    }

    #[test]
    fn test_layers_override_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "freebas.toml",
                r#"
                    log_level = "debug"

                    [http]
                    port = 8100

                    [bacnet]
                    device_instance = 1234
                    device_name = "Rooftop"
                "#,
            )?;
            jail.set_env("FREEBAS_HTTP__PORT", "8200");
            jail.set_env("FREEBAS_SCHEDULE__TIMEZONE", "America/Chicago");

            let config = AppConfig::load(&Args::default()).unwrap();
            assert_eq!(config.log_level, "debug");
            assert_eq!(config.http.port, 8200);
            assert_eq!(config.bacnet.device_instance, 1234);
            assert_eq!(config.bacnet.device_name, "Rooftop");
            assert_eq!(config.schedule.tz().unwrap(), Some(chrono_tz::America::Chicago));

            let args = Args {
                port: Some(8300),
                device_instance: Some(77),
                ..Args::default()
            };
            let config = AppConfig::load(&args).unwrap();
            assert_eq!(config.http.port, 8300);
            assert_eq!(config.bacnet.device_instance, 77);
            // Untouched by the flags
            assert_eq!(config.bacnet.device_name, "Rooftop");
            Ok(())
        });
    }

    #[test]
    fn test_named_config_must_exist() {
        Jail::expect_with(|_jail| {
            let args = Args {
                config: Some(PathBuf::from("missing.toml")),
                ..Args::default()
            };
            assert!(matches!(AppConfig::load(&args), Err(ConfigError::MissingFile(_))));
            Ok(())
        });
    }

    #[test]
    fn test_validation_failures() {
        Jail::expect_with(|jail| {
            jail.set_env("FREEBAS_SCHEDULE__TIMEZONE", "Mars/Olympus");
            assert!(matches!(
                AppConfig::load(&Args::default()),
                Err(ConfigError::UnknownTimezone(_))
            ));
            Ok(())
        });

        Jail::expect_with(|_jail| {
            let args = Args {
                tls: true,
                ..Args::default()
            };
            assert!(matches!(AppConfig::load(&args), Err(ConfigError::MissingTlsFile(_))));
            Ok(())
        });

        let config = AppConfig {
            bacnet: BacnetConfig {
                device_instance: MAX_INSTANCE,
                ..BacnetConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceInstance(_))
        ));
    }

    #[test]
    fn test_zero_sync_interval_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("FREEBAS_SYNC__INTERVAL_MS", "0");
            assert!(matches!(
                AppConfig::load(&Args::default()),
                Err(ConfigError::ZeroSyncInterval)
            ));

            jail.set_env("FREEBAS_SYNC__INTERVAL_MS", "250");
            assert_eq!(AppConfig::load(&Args::default()).unwrap().sync.interval_ms, 250);
            Ok(())
        });
    }

    #[test]
    fn test_tls_with_certificates() {
        Jail::expect_with(|jail| {
            std::fs::create_dir("certs").map_err(|e| e.to_string())?;
            jail.create_file("certs/certificate.pem", "cert")?;
            jail.create_file("certs/private.key", "key")?;
            let args = Args {
                tls: true,
                ..Args::default()
            };
            let config = AppConfig::load(&args).unwrap();
            assert!(config.http.tls);
            assert_eq!(config.http.tls_paths().0, PathBuf::from("certs/certificate.pem"));
            Ok(())
        });
    }

    #[test]
    fn test_redacted_hides_passwords() {
        let redacted = AppConfig::default().redacted();
        assert_eq!(redacted["users"][0]["username"], "admin");
        assert!(redacted["users"][0].get("password").is_none());
        assert_eq!(redacted["bacnet"]["device_instance"], 999);
    }
}
