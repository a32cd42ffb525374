//! Room Controller configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default bind address for health, metrics and admin endpoints.
pub const DEFAULT_ADMIN_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default maximum number of peers in one room.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 16;

/// Default dominant-speaker sampling interval in milliseconds.
pub const DEFAULT_SPEAKER_INTERVAL_MS: u64 = 800;

/// Default dominant-speaker silence threshold in dBov.
pub const DEFAULT_SPEAKER_THRESHOLD_DBOV: f32 = -80.0;

/// Default RTC port range for media workers.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default transport listen address.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default RC instance ID prefix.
pub const DEFAULT_RC_ID_PREFIX: &str = "rc";

/// Room Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health/metrics/admin bind address (default: "0.0.0.0:8081").
    pub admin_bind_address: String,

    /// Number of media workers (default: available CPU cores).
    pub num_workers: usize,

    /// Maximum peers admitted to one room (default: 16).
    pub max_peers_per_room: usize,

    /// Dominant-speaker sampling interval.
    pub speaker_interval: Duration,

    /// Dominant-speaker silence threshold in dBov.
    pub speaker_threshold_dbov: f32,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Address media transports listen on.
    pub listen_ip: IpAddr,

    /// Public address advertised to clients when behind NAT.
    pub announced_ip: Option<String>,

    /// HS256 secret used to validate admin bearer tokens.
    /// Protected by `SecretString` to prevent accidental logging.
    pub admin_jwt_secret: SecretString,

    /// Unique identifier for this RC instance.
    pub rc_id: String,

    /// Emit logs as JSON lines.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("admin_bind_address", &self.admin_bind_address)
            .field("num_workers", &self.num_workers)
            .field("max_peers_per_room", &self.max_peers_per_room)
            .field("speaker_interval", &self.speaker_interval)
            .field("speaker_threshold_dbov", &self.speaker_threshold_dbov)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("admin_jwt_secret", &"[REDACTED]")
            .field("rc_id", &self.rc_id)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `MissingEnvVar` if `RC_ADMIN_JWT_SECRET` is absent and
    /// `InvalidValue` for unparsable or inconsistent values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let admin_jwt_secret = SecretString::from(
            vars.get("RC_ADMIN_JWT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("RC_ADMIN_JWT_SECRET".to_string()))?
                .clone(),
        );

        let signaling_bind_address = vars
            .get("RC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let admin_bind_address = vars
            .get("RC_ADMIN_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ADMIN_BIND_ADDRESS.to_string());

        let num_workers = parse_var(vars, "RC_NUM_WORKERS", available_cores())?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let max_peers_per_room =
            parse_var(vars, "RC_MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?;
        if max_peers_per_room == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_MAX_PEERS_PER_ROOM must be at least 1".to_string(),
            ));
        }

        let speaker_interval_ms =
            parse_var(vars, "RC_SPEAKER_INTERVAL_MS", DEFAULT_SPEAKER_INTERVAL_MS)?;
        if speaker_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_SPEAKER_INTERVAL_MS must be positive".to_string(),
            ));
        }

        let speaker_threshold_dbov = parse_var(
            vars,
            "RC_SPEAKER_THRESHOLD_DBOV",
            DEFAULT_SPEAKER_THRESHOLD_DBOV,
        )?;
        if !(-127.0..=0.0).contains(&speaker_threshold_dbov) {
            return Err(ConfigError::InvalidValue(format!(
                "RC_SPEAKER_THRESHOLD_DBOV must be within -127..=0, got {speaker_threshold_dbov}"
            )));
        }

        let rtc_min_port = parse_var(vars, "RC_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "RC_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RC_RTC_MIN_PORT ({rtc_min_port}) exceeds RC_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = vars
            .get("RC_LISTEN_IP")
            .map_or(DEFAULT_LISTEN_IP, String::as_str)
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "RC_LISTEN_IP={}",
                    vars.get("RC_LISTEN_IP").map_or("", String::as_str)
                ))
            })?;

        let announced_ip = vars
            .get("RC_ANNOUNCED_IP")
            .filter(|ip| !ip.trim().is_empty())
            .cloned();

        let log_json = parse_var(vars, "RC_LOG_JSON", false)?;

        // Generate RC instance ID
        let rc_id = vars.get("RC_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RC_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            admin_bind_address,
            num_workers,
            max_peers_per_room,
            speaker_interval: Duration::from_millis(speaker_interval_ms),
            speaker_threshold_dbov,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            admin_jwt_secret,
            rc_id,
            log_json,
        })
    }
}
