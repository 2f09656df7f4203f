//! API server configuration

use paywire_billing::WebhookConfig;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    /// Bearer token for operator routes; those routes are not mounted without it
    pub admin_token: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub log_json: bool,
    pub webhook: WebhookConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "[redacted]"))
            .field("database_url", &self.database_url.as_ref().map(|_| "[redacted]"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[redacted]"))
            .field("log_json", &self.log_json)
            .field("webhook", &self.webhook)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            admin_token: non_empty_var("ADMIN_TOKEN"),
            database_url: non_empty_var("DATABASE_URL"),
            redis_url: non_empty_var("REDIS_URL"),
            log_json: std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")),
            webhook: WebhookConfig::from_env()?,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
