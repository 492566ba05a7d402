use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
    pub search: SearchConfig,
}

const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DUPLICATE_WINDOW_SECS: u64 = 60;

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let database_url = non_empty_var("DATABASE_URL");

        let timeout_ms = positive_u64_var("PROVIDER_TIMEOUT_MS", DEFAULT_PROVIDER_TIMEOUT_MS)
            .map_err(|_| ConfigError::InvalidProviderTimeout)?;
        let duplicate_window_secs =
            positive_u64_var("SEARCH_DUPLICATE_WINDOW_SECS", DEFAULT_DUPLICATE_WINDOW_SECS)
                .map_err(|_| ConfigError::InvalidDuplicateWindow)?;

        let provider = ProviderConfig {
            base_url: non_empty_var("PROVIDER_BASE_URL"),
            api_key: non_empty_var("PROVIDER_API_KEY"),
            timeout: Duration::from_millis(timeout_ms),
        };

        if environment == AppEnvironment::Production && provider.base_url.is_none() {
            return Err(ConfigError::MissingProvider);
        }

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            storage: StorageConfig { database_url },
            provider,
            search: SearchConfig {
                duplicate_window_secs,
            },
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive_u64_var(key: &str, default: u64) -> Result<u64, ()> {
    match non_empty_var(key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<u64>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(()),
        },
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Durable store selection. Without a database URL the service keeps its ledger in memory.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: Option<String>,
}

/// Outbound property-data provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Width of the time bucket folded into each search fingerprint.
    pub duplicate_window_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            duplicate_window_secs: DEFAULT_DUPLICATE_WINDOW_SECS,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidProviderTimeout,
    InvalidDuplicateWindow,
    MissingProvider,
    MissingDatabase,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidProviderTimeout => {
                write!(f, "PROVIDER_TIMEOUT_MS must be a positive integer")
            }
            ConfigError::InvalidDuplicateWindow => {
                write!(f, "SEARCH_DUPLICATE_WINDOW_SECS must be a positive integer")
            }
            ConfigError::MissingProvider => {
                write!(f, "PROVIDER_BASE_URL is required in production")
            }
            ConfigError::MissingDatabase => {
                write!(f, "DATABASE_URL is required for this command")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidProviderTimeout
            | ConfigError::InvalidDuplicateWindow
            | ConfigError::MissingProvider
            | ConfigError::MissingDatabase => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "DATABASE_URL",
            "PROVIDER_BASE_URL",
            "PROVIDER_API_KEY",
            "PROVIDER_TIMEOUT_MS",
            "SEARCH_DUPLICATE_WINDOW_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.storage.database_url.is_none());
        assert!(config.provider.base_url.is_none());
        assert_eq!(config.provider.timeout, Duration::from_millis(10_000));
        assert_eq!(config.search.duplicate_window_secs, 60);
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn rejects_zero_provider_timeout() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PROVIDER_TIMEOUT_MS", "0");
        let result = AppConfig::load();
        reset_env();
        assert!(matches!(result, Err(ConfigError::InvalidProviderTimeout)));
    }

    #[test]
    fn production_requires_provider_base_url() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_ENV", "production");
        let missing = AppConfig::load();
        env::set_var("PROVIDER_BASE_URL", "https://data.example.com");
        env::set_var("SEARCH_DUPLICATE_WINDOW_SECS", "30");
        let configured = AppConfig::load();
        reset_env();

        assert!(matches!(missing, Err(ConfigError::MissingProvider)));
        let config = configured.expect("production config loads");
        assert_eq!(config.environment, AppEnvironment::Production);
        assert_eq!(config.search.duplicate_window_secs, 30);
        assert_eq!(
            config.provider.base_url.as_deref(),
            Some("https://data.example.com")
        );
    }
}
