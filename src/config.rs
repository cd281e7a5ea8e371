use serde::{Deserialize, Serialize};

/// Gateway configuration. Built-in defaults, optionally overridden by a
/// `gateway.*` config file and `GATEWAY_`-prefixed environment variables
/// (e.g. `GATEWAY_SERVER__PORT=8080`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub routes_file: String,
    pub auth: AuthConfig,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitConfig,
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub public_key_path: String,
    /// Expected `iss` claim; unset disables the issuer check.
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceConfig {
    pub enabled: bool,
}

pub fn load_config() -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 5000i64)?
        .set_default("routes_file", "config/routes.yaml")?
        .set_default("auth.public_key_path", "keys/public.pem")?
        .set_default("redis.addr", "redis:6379")?
        .set_default("rate_limit.requests_per_minute", 100i64)?
        .set_default("trace.enabled", true)?
        .add_source(config::File::with_name("gateway").required(false))
        .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.routes_file.is_empty() {
        anyhow::bail!("routes_file cannot be empty");
    }
    if cfg.auth.public_key_path.is_empty() {
        anyhow::bail!("auth.public_key_path cannot be empty");
    }
    if cfg.redis.addr.is_empty() {
        anyhow::bail!("redis.addr cannot be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            routes_file: "config/routes.yaml".to_string(),
            auth: AuthConfig {
                public_key_path: "keys/public.pem".to_string(),
                issuer: None,
            },
            redis: RedisConfig {
                addr: "redis:6379".to_string(),
            },
            rate_limit: RateLimitConfig {
                requests_per_minute: 100,
            },
            trace: TraceConfig { enabled: true },
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(validate_config(&default_config()).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let mut cfg = default_config();
        cfg.routes_file.clear();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = default_config();
        cfg.auth.public_key_path.clear();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = default_config();
        cfg.redis.addr.clear();
        assert!(validate_config(&cfg).is_err());
    }
}
