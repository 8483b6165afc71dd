use std::{collections::BTreeMap, env, fmt, net::SocketAddr, time::Duration};

use payhook_core::{FailurePolicy, Gateway, GatewaySettings, MAX_DEDUP_RETENTION};
use url::Url;

use crate::{DEFAULT_BIND_ADDR, DEFAULT_DATABASE_URL, DEFAULT_MAINTENANCE_INTERVAL_SECS};

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub forward_url: Option<Url>,
    pub maintenance_interval: Duration,
    /// Gateways with a webhook secret configured. Others stay disabled.
    pub gateways: BTreeMap<Gateway, GatewaySettings>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let env_value = lookup("APP_ENV").unwrap_or_else(|| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = lookup("APP_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(ConfigError::BindAddress)?;
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let forward_url = lookup("APP_FORWARD_URL")
            .map(|value| {
                Url::parse(&value).map_err(|err| ConfigError::invalid("APP_FORWARD_URL", &value, err))
            })
            .transpose()?;

        let interval_secs = parse_positive_secs(
            "APP_MAINTENANCE_INTERVAL_SECS",
            lookup("APP_MAINTENANCE_INTERVAL_SECS"),
            DEFAULT_MAINTENANCE_INTERVAL_SECS,
        )?;

        let mut gateways = BTreeMap::new();
        for gateway in Gateway::ALL {
            if let Some(settings) = gateway_settings(gateway, &lookup)? {
                gateways.insert(gateway, settings);
            }
        }

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            forward_url,
            maintenance_interval: Duration::from_secs(interval_secs),
            gateways,
        })
    }
}

fn gateway_settings<F>(gateway: Gateway, lookup: &F) -> Result<Option<GatewaySettings>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = gateway.as_str().to_ascii_uppercase();
    let key = |suffix: &str| format!("{prefix}_{suffix}");

    let Some(secret) = lookup(&key("WEBHOOK_SECRET")) else {
        return Ok(None);
    };
    let defaults = GatewaySettings::new(gateway, secret);

    let tolerance_key = key("REPLAY_TOLERANCE_SECONDS");
    let tolerance = parse_positive_secs(
        &tolerance_key,
        lookup(&tolerance_key),
        defaults.replay_tolerance.as_secs(),
    )?;

    let retention_key = key("DEDUP_RETENTION_SECONDS");
    let retention = parse_positive_secs(
        &retention_key,
        lookup(&retention_key),
        defaults.dedup_retention.as_secs(),
    )?;
    if retention < tolerance {
        return Err(ConfigError::InvalidValue {
            key: retention_key,
            value: retention.to_string(),
            reason: format!("must not be shorter than the replay tolerance ({tolerance}s)"),
        });
    }
    let max_retention = MAX_DEDUP_RETENTION.as_secs();
    if retention > max_retention {
        return Err(ConfigError::InvalidValue {
            key: retention_key,
            value: retention.to_string(),
            reason: format!("must not exceed {max_retention} seconds (30 days)"),
        });
    }

    let policy_key = key("FAILURE_POLICY");
    let failure_policy = match lookup(&policy_key) {
        Some(value) => value
            .parse::<FailurePolicy>()
            .map_err(|err| ConfigError::invalid(&policy_key, &value, err))?,
        None => defaults.failure_policy,
    };

    let reject_key = key("REJECT_UNKNOWN_EVENTS");
    let reject_unknown_events = match lookup(&reject_key) {
        Some(value) => parse_bool(&reject_key, &value)?,
        None => false,
    };

    Ok(Some(
        defaults
            .with_replay_tolerance(Duration::from_secs(tolerance))
            .with_dedup_retention(Duration::from_secs(retention))
            .with_failure_policy(failure_policy)
            .with_reject_unknown_events(reject_unknown_events),
    ))
}

fn parse_positive_secs(key: &str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::invalid(key, &value, "must be greater than zero")),
        Ok(secs) => Ok(secs),
        Err(err) => Err(ConfigError::invalid(key, &value, err)),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected true or false")),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key} value '{value}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{LazyLock, Mutex},
    };

    use payhook_core::SignatureStrategy;

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn loads_defaults_in_development() {
        let config = load(&[]).expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.maintenance_interval, Duration::from_secs(60));
        assert!(config.forward_url.is_none());
        assert!(config.gateways.is_empty());
    }

    #[test]
    fn rejects_invalid_environment() {
        let err = load(&[("APP_ENV", "invalid")]).expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));
    }

    #[test]
    fn enables_gateways_with_a_secret() {
        let config = load(&[
            ("STRIPE_WEBHOOK_SECRET", "whsec_1"),
            ("STRIPE_REPLAY_TOLERANCE_SECONDS", "120"),
            ("NOWPAYMENTS_WEBHOOK_SECRET", "ipn-secret"),
            ("COINGATE_WEBHOOK_SECRET", "   "),
        ])
        .expect("config should load");

        assert_eq!(
            config.gateways.keys().copied().collect::<Vec<_>>(),
            vec![Gateway::Stripe, Gateway::NowPayments]
        );
        let stripe = &config.gateways[&Gateway::Stripe];
        assert_eq!(stripe.secret, "whsec_1");
        assert_eq!(
            stripe.strategy,
            SignatureStrategy::TimestampedHmac {
                tolerance: Duration::from_secs(120)
            }
        );
        assert_eq!(stripe.failure_policy, FailurePolicy::Retry);
        assert_eq!(
            config.gateways[&Gateway::NowPayments].failure_policy,
            FailurePolicy::Acknowledge
        );
    }

    #[test]
    fn per_gateway_overrides_apply() {
        let config = load(&[
            ("CRYPTOMUS_WEBHOOK_SECRET", "api-key"),
            ("CRYPTOMUS_DEDUP_RETENTION_SECONDS", "86400"),
            ("CRYPTOMUS_FAILURE_POLICY", "acknowledge"),
            ("CRYPTOMUS_REJECT_UNKNOWN_EVENTS", "true"),
        ])
        .expect("config should load");

        let cryptomus = &config.gateways[&Gateway::Cryptomus];
        assert_eq!(cryptomus.dedup_retention, Duration::from_secs(86_400));
        assert_eq!(cryptomus.failure_policy, FailurePolicy::Acknowledge);
        assert!(cryptomus.reject_unknown_events);
    }

    #[test]
    fn retention_shorter_than_tolerance_is_rejected() {
        let err = load(&[
            ("STRIPE_WEBHOOK_SECRET", "whsec_1"),
            ("STRIPE_DEDUP_RETENTION_SECONDS", "60"),
        ])
        .expect_err("retention below tolerance should error");

        assert!(matches!(
            &err,
            ConfigError::InvalidValue { key, .. } if key == "STRIPE_DEDUP_RETENTION_SECONDS"
        ));
        assert!(err.to_string().contains("replay tolerance"));
    }

    #[test]
    fn retention_above_thirty_days_is_rejected() {
        for value in ["2592001", "1000000000000000", "18446744073709551615"] {
            let err = load(&[
                ("NOWPAYMENTS_WEBHOOK_SECRET", "ipn"),
                ("NOWPAYMENTS_DEDUP_RETENTION_SECONDS", value),
            ])
            .expect_err("oversized retention should error");

            assert!(matches!(
                &err,
                ConfigError::InvalidValue { key, .. } if key == "NOWPAYMENTS_DEDUP_RETENTION_SECONDS"
            ));
            assert!(err.to_string().contains("2592000"), "{err}");
        }

        let config = load(&[
            ("NOWPAYMENTS_WEBHOOK_SECRET", "ipn"),
            ("NOWPAYMENTS_DEDUP_RETENTION_SECONDS", "2592000"),
        ])
        .expect("thirty days is allowed");
        assert_eq!(
            config.gateways[&Gateway::NowPayments].dedup_retention,
            MAX_DEDUP_RETENTION
        );
    }

    #[test]
    fn rejects_zero_and_garbage_values() {
        assert!(load(&[
            ("COINGATE_WEBHOOK_SECRET", "token"),
            ("COINGATE_DEDUP_RETENTION_SECONDS", "0"),
        ])
        .is_err());
        assert!(load(&[
            ("COINGATE_WEBHOOK_SECRET", "token"),
            ("COINGATE_FAILURE_POLICY", "sometimes"),
        ])
        .is_err());
        assert!(load(&[("APP_FORWARD_URL", "not a url")]).is_err());
        assert!(load(&[("APP_MAINTENANCE_INTERVAL_SECS", "soon")]).is_err());
    }

    #[test]
    fn parses_production_environment_from_process_env() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("APP_FORWARD_URL", "http://127.0.0.1:9100/events");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(
            config.forward_url.map(|url| url.to_string()),
            Some("http://127.0.0.1:9100/events".to_string())
        );

        env::remove_var("APP_ENV");
        env::remove_var("APP_BIND_ADDR");
        env::remove_var("APP_FORWARD_URL");
    }
}
