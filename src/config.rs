use anyhow::{bail, Context};

const MIN_SECRET_LEN: usize = 32;

/// Process settings read once at startup. Rate limits and media backends read
/// their own variables (see `rate_limit` and `storage`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub frontend_url: Option<String>,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if secret.len() < MIN_SECRET_LEN {
            bail!("JWT_SECRET must be at least {MIN_SECRET_LEN} characters long");
        }
        let db_max_connections = match std::env::var("DB_MAX_CONNECTIONS") {
            Ok(v) => v.parse().with_context(|| format!("DB_MAX_CONNECTIONS is not a number: {v}"))?,
            Err(_) => 5,
        };
        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            frontend_url: std::env::var("FRONTEND_URL").ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections,
        })
    }
}
