//! Typed getters over the process environment, mirroring the set of
//! variables the facade and its backends recognise. An `env:` expression
//! (see [`crate::value`]) reads any other name directly; these are just the
//! ones the engine or its default backends consult on their own behalf.

use std::env;

#[derive(Debug, Clone, Default)]
pub struct RedisConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            host: env::var("REDIS_HOST").ok(),
            port: env::var("REDIS_PORT").ok().and_then(|p| p.parse().ok()),
            username: env::var("REDIS_USERNAME").ok(),
            password: env::var("REDIS_PASSWORD").ok(),
        }
    }

    /// Assembles a `redis://` URL from the discrete env vars, the shape the
    /// redis-url input mix-in hands to an action.
    pub fn url(&self) -> Option<String> {
        let host = self.host.as_ref()?;
        let port = self.port.unwrap_or(6379);
        let auth = match (&self.username, &self.password) {
            (Some(u), Some(p)) => format!("{u}:{p}@"),
            (None, Some(p)) => format!(":{p}@"),
            _ => String::new(),
        };
        Some(format!("redis://{auth}{host}:{port}"))
    }
}

pub fn bucket_name() -> Option<String> {
    env::var("BUCKET_NAME").ok()
}

pub fn aws_endpoint_url() -> Option<String> {
    env::var("AWS_ENDPOINT_URL").ok()
}

pub fn aws_access_key_id() -> Option<String> {
    env::var("AWS_ACCESS_KEY_ID").ok()
}

pub fn aws_secret_access_key() -> Option<String> {
    env::var("AWS_SECRET_ACCESS_KEY").ok()
}

pub fn openai_api_key() -> Option<String> {
    env::var("OPENAI_API_KEY").ok()
}

pub fn anthropic_api_key() -> Option<String> {
    env::var("ANTHROPIC_API_KEY").ok()
}

pub fn ollama_api_base() -> Option<String> {
    env::var("OLLAMA_API_BASE").ok()
}

pub fn gcp_credentials_64() -> Option<String> {
    env::var("GCP_CREDENTIALS_64").ok()
}

pub fn database_url() -> Option<String> {
    env::var("DATABASE_URL").ok()
}

/// Backing implementation for an `env:` expression: fails if the named
/// variable is unset, rather than falling back to an empty string.
pub fn lookup(name: &str) -> crate::error::Result<String> {
    env::var(name).map_err(|_| crate::error::Error::UnknownVariable(format!("env:{name}")))
}
