use std::sync::Arc;

use knowballs_core::{
    auth::{AuthBackend, MockAuthBackend, SupabaseAuthBackend},
    config::AppConfig,
    gate::RouteRules,
    history::{HistoryService, HistoryStore, InMemoryHistoryStore, PostgresHistoryStore},
    http::{self, AppState},
    proxy::{InferenceProxy, UpstreamEndpoints},
};
use anyhow::bail;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;

    let auth = build_auth_backend(&config)?;
    let history = build_history_store(&config).await?;
    let proxy = Arc::new(InferenceProxy::new(UpstreamEndpoints {
        dev: config.dev_api_url.clone(),
        prod: config.prod_api_url.clone(),
    }));
    info!(dev = %config.dev_api_url, prod = %config.prod_api_url, "inference endpoints configured");

    if !config.secure_cookies && config.site_url.starts_with("https://") {
        warn!("SITE_URL is https but SECURE_COOKIES is off; session cookies will not be marked Secure");
    }

    let app = http::router(AppState {
        auth,
        history: HistoryService::new(history),
        proxy,
        session_policy: config.session_policy(),
        routes: RouteRules::default(),
        site_url: config.site_url.clone(),
    });
    let listener = TcpListener::bind(config.http_bind).await?;
    info!("Knowballs HTTP API listening on {}", config.http_bind);

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();
}

fn build_auth_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn AuthBackend>> {
    let supabase = || {
        config
            .supabase_url
            .clone()
            .zip(config.supabase_anon_key.clone())
            .map(|(url, key)| SupabaseAuthBackend::new(url, key))
    };

    let provider = config.auth_provider.to_lowercase();
    let backend: Arc<dyn AuthBackend> = match provider.as_str() {
        "supabase" => {
            let Some(backend) = supabase() else {
                bail!("AUTH_PROVIDER=supabase requires SUPABASE_URL and SUPABASE_ANON_KEY");
            };
            info!("using Supabase auth backend");
            Arc::new(backend)
        }
        "mock" => {
            warn!("AUTH_PROVIDER=mock; using in-process mock auth backend");
            Arc::new(MockAuthBackend::default())
        }
        other => {
            if other != "auto" {
                warn!(
                    provider = %other,
                    "unknown AUTH_PROVIDER value; valid values are auto|supabase|mock; falling back to auto"
                );
            }
            if let Some(backend) = supabase() {
                info!("using Supabase auth backend (auto mode)");
                Arc::new(backend)
            } else {
                warn!("No Supabase credentials configured; using mock auth backend");
                Arc::new(MockAuthBackend::default())
            }
        }
    };
    Ok(backend)
}

async fn build_history_store(config: &AppConfig) -> anyhow::Result<Arc<dyn HistoryStore>> {
    if let Some(database_url) = &config.database_url {
        let store = PostgresHistoryStore::connect(database_url).await?;
        info!("Connected to Postgres history store");
        Ok(Arc::new(store))
    } else {
        warn!("DATABASE_URL not set; using in-memory history store");
        Ok(Arc::new(InMemoryHistoryStore::default()))
    }
}

#[cfg(test)]
mod tests {
    use knowballs_core::config::AppConfig;

    use super::build_auth_backend;

    fn config(provider: &str, supabase: Option<(&str, &str)>) -> AppConfig {
        AppConfig {
            http_bind: "127.0.0.1:0".parse().expect("addr"),
            site_url: "http://localhost:3000".to_owned(),
            auth_provider: provider.to_owned(),
            supabase_url: supabase.map(|(url, _)| url.to_owned()),
            supabase_anon_key: supabase.map(|(_, key)| key.to_owned()),
            database_url: None,
            dev_api_url: "http://localhost:8000/api/query".to_owned(),
            prod_api_url: "http://localhost:8001/api/query".to_owned(),
            session_refresh_margin_sec: 60,
            secure_cookies: false,
        }
    }

    #[test]
    fn explicit_supabase_without_credentials_fails() {
        let error = build_auth_backend(&config("supabase", None))
            .err()
            .expect("missing credentials rejected");
        assert!(error.to_string().contains("SUPABASE_URL"));
    }

    #[test]
    fn supabase_with_credentials_builds() {
        let config = config("supabase", Some(("https://project.supabase.co", "anon")));
        assert!(build_auth_backend(&config).is_ok());
    }

    #[test]
    fn mock_and_auto_fall_back_without_credentials() {
        assert!(build_auth_backend(&config("mock", None)).is_ok());
        assert!(build_auth_backend(&config("auto", None)).is_ok());
        assert!(build_auth_backend(&config("bogus", None)).is_ok());
    }
}
