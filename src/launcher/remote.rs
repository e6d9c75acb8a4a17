//! Launcher backed by the ecosystem's REST API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{DetailedRun, SubmitRequest, TestRuns};
use super::Launcher;
use crate::error::LaunchError;

/// Connection settings for the remote API.
#[derive(Debug, Clone)]
pub struct RemoteLauncherConfig {
    /// Base URL of the API, e.g. `https://ecosystem.example.com/api`.
    pub api_base: String,
    /// Bearer token sent with every request, if any.
    pub api_token: Option<String>,
    /// How many times a failed status query is retried.
    pub max_retries: u32,
    /// Delay before the first retry; grows linearly with each attempt.
    pub retry_backoff: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl RemoteLauncherConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_token: None,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.api_token = token;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }
}

/// Request body for `POST /runs/{group}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestRunRequest {
    class_names: Vec<String>,
    requestor_type: String,
    requestor: String,
    test_stream: String,
    obr: String,
    trace: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    gherkin_url: String,
    overrides: BTreeMap<String, String>,
}

impl From<&SubmitRequest> for TestRunRequest {
    fn from(request: &SubmitRequest) -> Self {
        let class_names = if request.class_name.is_empty() {
            Vec::new()
        } else {
            vec![request.class_name.clone()]
        };
        Self {
            class_names,
            requestor_type: request.request_type.clone(),
            requestor: request.requestor.clone(),
            test_stream: request.stream.clone(),
            obr: request.obr.clone(),
            trace: request.trace,
            gherkin_url: request.gherkin_url.clone(),
            overrides: request.overrides.clone(),
        }
    }
}

/// Submits and tracks runs through the REST API.
pub struct RemoteLauncher {
    http_client: Client,
    config: RemoteLauncherConfig,
}

impl RemoteLauncher {
    /// Builds a launcher; fails only if the HTTP client cannot be constructed.
    pub fn new(config: RemoteLauncherConfig) -> Result<Self, LaunchError> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http_client,
            config,
        })
    }

    fn runs_url(&self, group: &str) -> String {
        format!(
            "{}/runs/{}",
            self.config.api_base.trim_end_matches('/'),
            urlencoding::encode(group)
        )
    }

    fn ras_run_url(&self, run_id: &str) -> String {
        format!(
            "{}/ras/runs/{}",
            self.config.api_base.trim_end_matches('/'),
            urlencoding::encode(run_id)
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// GETs a JSON document, retrying transport failures and 5xx responses.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, LaunchError> {
        let mut attempt = 0;
        loop {
            let result = self.get_json_once(url).await;
            match result {
                Err(err) if attempt < self.config.max_retries && is_retryable(&err) => {
                    attempt += 1;
                    let delay = self.config.retry_backoff * attempt;
                    warn!(url, attempt, error = %err, "Request failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn get_json_once<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, LaunchError> {
        let response = self
            .authorize(self.http_client.get(url))
            .header("Accept", "application/json")
            .send()
            .await?;
        parse_response(response).await
    }
}

fn is_retryable(err: &LaunchError) -> bool {
    match err {
        LaunchError::Http(_) => true,
        LaunchError::Api { code, .. } => *code >= 500,
        _ => false,
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, LaunchError> {
    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::CREATED {
        let message = response.text().await.unwrap_or_default();
        return Err(LaunchError::Api {
            code: status.as_u16(),
            message,
        });
    }
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl Launcher for RemoteLauncher {
    async fn submit_test_run(&self, request: &SubmitRequest) -> Result<TestRuns, LaunchError> {
        let url = self.runs_url(&request.group);
        let body = TestRunRequest::from(request);
        debug!(url = %url, class = %request.class_name, "Submitting test run");

        // Submissions are never retried.
        let response = self
            .authorize(self.http_client.post(&url))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        parse_response(response).await
    }

    async fn get_runs_by_group(&self, group: &str) -> Result<TestRuns, LaunchError> {
        self.get_json(&self.runs_url(group)).await
    }

    async fn get_run_by_id(&self, run_id: &str) -> Result<DetailedRun, LaunchError> {
        self.get_json(&self.ras_run_url(run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_url_encodes_group() {
        let launcher = RemoteLauncher::new(RemoteLauncherConfig::new("http://host/api/")).unwrap();
        assert_eq!(
            launcher.runs_url("my group"),
            "http://host/api/runs/my%20group"
        );
        assert_eq!(launcher.ras_run_url("abc"), "http://host/api/ras/runs/abc");
    }

    #[test]
    fn test_request_body_shape() {
        let mut overrides = BTreeMap::new();
        overrides.insert("a".to_string(), "b".to_string());
        let request = SubmitRequest {
            group: "g1".to_string(),
            class_name: "my.bundle/my.bundle.MyTest".to_string(),
            request_type: "CLI".to_string(),
            requestor: "me".to_string(),
            stream: "main".to_string(),
            obr: "mvn:a/b/1/obr".to_string(),
            trace: true,
            overrides,
            ..Default::default()
        };

        let body = serde_json::to_value(TestRunRequest::from(&request)).unwrap();
        assert_eq!(body["classNames"][0], "my.bundle/my.bundle.MyTest");
        assert_eq!(body["requestorType"], "CLI");
        assert_eq!(body["testStream"], "main");
        assert_eq!(body["trace"], true);
        assert_eq!(body["overrides"]["a"], "b");
        assert!(body.get("gherkinUrl").is_none());
    }

    #[test]
    fn test_only_server_errors_are_retried() {
        assert!(is_retryable(&LaunchError::Api {
            code: 503,
            message: String::new()
        }));
        assert!(!is_retryable(&LaunchError::Api {
            code: 404,
            message: String::new()
        }));
        assert!(!is_retryable(&LaunchError::UnknownRun("x".into())));
    }
}
