use std::{env, net::SocketAddr};

use chrono::Duration;

use crate::session::SessionPolicy;

pub const DEFAULT_DEV_API_URL: &str = "http://localhost:8000/api/query";
pub const DEFAULT_PROD_API_URL: &str = "https://api.production-server.com/api/query";

const MAX_REFRESH_MARGIN_SEC: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: SocketAddr,
    pub site_url: String,
    pub auth_provider: String,
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub database_url: Option<String>,
    pub dev_api_url: String,
    pub prod_api_url: String,
    pub session_refresh_margin_sec: u64,
    pub secure_cookies: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_owned());
        let http_bind = env::var("HTTP_BIND").unwrap_or_else(|_| format!("0.0.0.0:{port}"));
        let http_bind = http_bind.parse()?;

        Ok(Self {
            http_bind,
            site_url: env::var("SITE_URL")
                .map(|url| url.trim_end_matches('/').to_owned())
                .unwrap_or_else(|_| "http://localhost:3000".to_owned()),
            auth_provider: env::var("AUTH_PROVIDER").unwrap_or_else(|_| "auto".to_owned()),
            supabase_url: env_non_empty("SUPABASE_URL"),
            supabase_anon_key: env_non_empty("SUPABASE_ANON_KEY"),
            database_url: env_non_empty("DATABASE_URL"),
            dev_api_url: env::var("DEV_API_URL")
                .unwrap_or_else(|_| DEFAULT_DEV_API_URL.to_owned()),
            prod_api_url: env::var("PROD_API_URL")
                .unwrap_or_else(|_| DEFAULT_PROD_API_URL.to_owned()),
            session_refresh_margin_sec: env_u64("SESSION_REFRESH_MARGIN_SEC", 60),
            secure_cookies: env_bool("SECURE_COOKIES", false),
        })
    }

    pub fn session_policy(&self) -> SessionPolicy {
        let margin = self.session_refresh_margin_sec.min(MAX_REFRESH_MARGIN_SEC);
        SessionPolicy {
            refresh_margin: Duration::seconds(margin as i64),
            secure_cookies: self.secure_cookies,
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|raw| {
            matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
