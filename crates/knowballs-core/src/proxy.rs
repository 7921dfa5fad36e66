use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamEnv {
    Dev,
    Prod,
}

impl UpstreamEnv {
    /// Anything other than an explicit `prod` selects the dev endpoint.
    pub fn select(raw: Option<&str>) -> Self {
        match raw {
            Some("prod") => UpstreamEnv::Prod,
            _ => UpstreamEnv::Dev,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamEnv::Dev => "dev",
            UpstreamEnv::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamEndpoints {
    pub dev: String,
    pub prod: String,
}

impl UpstreamEndpoints {
    pub fn url_for(&self, env: UpstreamEnv) -> &str {
        match env {
            UpstreamEnv::Dev => &self.dev,
            UpstreamEnv::Prod => &self.prod,
        }
    }
}

/// Forwards queries to the inference API. No retries and no timeout beyond
/// the client default; the upstream body is relayed untouched.
#[derive(Debug, Clone)]
pub struct InferenceProxy {
    client: Client,
    endpoints: UpstreamEndpoints,
}

impl InferenceProxy {
    pub fn new(endpoints: UpstreamEndpoints) -> Self {
        Self {
            client: Client::new(),
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &UpstreamEndpoints {
        &self.endpoints
    }

    pub async fn forward(
        &self,
        env: UpstreamEnv,
        mode: &str,
        body: Value,
    ) -> Result<Value, ApiError> {
        let payload = with_mode(body, mode)?;
        let url = self.endpoints.url_for(env);
        info!(env = env.as_str(), %url, %mode, "forwarding query to inference API");

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("inference API request failed")?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                env = env.as_str(),
                status = status.as_u16(),
                reason = status.canonical_reason().unwrap_or_default(),
                "inference API returned error status"
            );
            return Err(ApiError::Upstream(mirror_status(status)));
        }

        let data = response
            .json::<Value>()
            .await
            .context("inference API returned a non-JSON body")?;
        Ok(data)
    }
}

fn mirror_status(status: StatusCode) -> axum::http::StatusCode {
    axum::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY)
}

/// The client body with `mode` set, overriding any client-supplied value.
pub fn with_mode(body: Value, mode: &str) -> Result<Value, ApiError> {
    let Value::Object(mut fields) = body else {
        return Err(ApiError::Validation(
            "Request body must be a JSON object".to_owned(),
        ));
    };
    fields.insert("mode".to_owned(), Value::String(mode.to_owned()));
    Ok(Value::Object(fields))
}
