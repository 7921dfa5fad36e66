use anyhow::{Context, bail};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, header};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    proxy::UpstreamEnv,
    types::{HistoryListResponse, QueryMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProbe {
    Authenticated,
    Unauthenticated,
}

/// What the main panel needs from the server.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn check_session(&self) -> anyhow::Result<SessionProbe>;

    /// Raw inference payload; decoding is the caller's job.
    async fn query(&self, prompt: &str, mode: QueryMode) -> anyhow::Result<Value>;

    async fn save_history(&self, prompt: &str, answer: &str, mode: QueryMode)
    -> anyhow::Result<()>;
}

/// What the sidebar history list needs from the server.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// `None` when the caller has no session.
    async fn list_history(
        &self,
        page: u32,
        limit: u32,
        search: Option<&str>,
    ) -> anyhow::Result<Option<HistoryListResponse>>;

    async fn delete_history(&self, id: i64) -> anyhow::Result<()>;
}

/// HTTP client for the Knowballs API. Carries the session as a cookie header.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    env: UpstreamEnv,
    cookie: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            env: UpstreamEnv::Dev,
            cookie: None,
        }
    }

    pub fn with_env(mut self, env: UpstreamEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.cookie {
            Some(cookie) => request.header(header::COOKIE, cookie),
            None => request,
        }
    }
}

#[async_trait]
impl QueryBackend for ApiClient {
    async fn check_session(&self) -> anyhow::Result<SessionProbe> {
        let response = self
            .request(Method::GET, "/api/auth/check")
            .send()
            .await
            .context("auth check request failed")?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Ok(SessionProbe::Unauthenticated),
            status if status.is_success() => Ok(SessionProbe::Authenticated),
            status => bail!("auth check failed with status {status}"),
        }
    }

    async fn query(&self, prompt: &str, mode: QueryMode) -> anyhow::Result<Value> {
        let path = format!("/api/proxy?mode={}&env={}", mode.as_str(), self.env.as_str());
        debug!(%mode, env = self.env.as_str(), "sending query");
        let response = self
            .request(Method::POST, &path)
            .json(&json!({ "query": prompt }))
            .send()
            .await
            .context("query request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("query failed with status {status}: {body}");
        }
        response
            .json::<Value>()
            .await
            .context("query response was not JSON")
    }

    async fn save_history(
        &self,
        prompt: &str,
        answer: &str,
        mode: QueryMode,
    ) -> anyhow::Result<()> {
        let response = self
            .request(Method::POST, "/api/history/save")
            .json(&json!({ "prompt": prompt, "answer": answer, "mode": mode }))
            .send()
            .await
            .context("history save request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("history save failed with status {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryBackend for ApiClient {
    async fn list_history(
        &self,
        page: u32,
        limit: u32,
        search: Option<&str>,
    ) -> anyhow::Result<Option<HistoryListResponse>> {
        let mut path = format!("/api/history?page={page}&limit={limit}");
        if let Some(search) = search.filter(|search| !search.is_empty()) {
            path.push_str("&query=");
            path.push_str(&urlencoding::encode(search));
        }

        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .context("history request failed")?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Ok(None),
            status if status.is_success() => response
                .json::<HistoryListResponse>()
                .await
                .map(Some)
                .context("history response was malformed"),
            status => bail!("history request failed with status {status}"),
        }
    }

    async fn delete_history(&self, id: i64) -> anyhow::Result<()> {
        let response = self
            .request(Method::DELETE, &format!("/api/history/delete?id={id}"))
            .send()
            .await
            .context("history delete request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("history delete failed with status {status}: {body}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Json, Router, routing::post};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use crate::{
        auth::MockAuthBackend,
        gate::RouteRules,
        history::{HistoryService, InMemoryHistoryStore},
        http::{AppState, router},
        proxy::{InferenceProxy, UpstreamEndpoints},
        session::SessionPolicy,
        types::QueryMode,
    };

    use super::{ApiClient, HistoryBackend, QueryBackend, SessionProbe};

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn spawn_stack(auth: MockAuthBackend) -> String {
        let upstream = serve(Router::new().route(
            "/api/query",
            post(|Json(body): Json<Value>| async move {
                Json(json!({ "answer": format!("answer to {}", body["query"]), "tool_used": "stats" }))
            }),
        ))
        .await;

        let state = AppState {
            auth: Arc::new(auth),
            history: HistoryService::new(Arc::new(InMemoryHistoryStore::default())),
            proxy: Arc::new(InferenceProxy::new(UpstreamEndpoints {
                dev: format!("{upstream}/api/query"),
                prod: format!("{upstream}/api/query"),
            })),
            session_policy: SessionPolicy::default(),
            routes: RouteRules::default(),
            site_url: "http://localhost:3000".to_owned(),
        };
        serve(router(state)).await
    }

    #[tokio::test]
    async fn signed_in_client_round_trips_history() {
        let auth = MockAuthBackend::default();
        auth.seed_user("fan@example.com", "hunter22").await;
        let session = auth.issue_session("fan@example.com").await.expect("session");
        let base = spawn_stack(auth).await;
        let client = ApiClient::new(base).with_cookie(format!(
            "kb-access-token={}; kb-refresh-token={}",
            session.access_token, session.refresh_token
        ));

        assert_eq!(
            client.check_session().await.expect("check"),
            SessionProbe::Authenticated
        );
        let payload = client
            .query("Who won in 1998?", QueryMode::Answer)
            .await
            .expect("query");
        assert_eq!(payload["tool_used"], "stats");

        client
            .save_history("Who won in 1998?", "Chicago", QueryMode::Visualizer)
            .await
            .expect("save");
        let page = client
            .list_history(1, 10, Some("won in"))
            .await
            .expect("list")
            .expect("signed in");
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].mode, QueryMode::Visualizer);

        client.delete_history(page.data[0].id).await.expect("delete");
        let page = client
            .list_history(1, 10, None)
            .await
            .expect("list")
            .expect("signed in");
        assert!(page.data.is_empty());
    }

    #[tokio::test]
    async fn anonymous_client_sees_no_history() {
        let base = spawn_stack(MockAuthBackend::default()).await;
        let client = ApiClient::new(base);

        assert_eq!(
            client.check_session().await.expect("check"),
            SessionProbe::Unauthenticated
        );
        assert!(client.list_history(1, 10, None).await.expect("list").is_none());
        assert!(
            client
                .save_history("prompt", "answer", QueryMode::Answer)
                .await
                .is_err()
        );
    }
}
