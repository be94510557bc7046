use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use frontdesk_core::config::LlmConfig;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Ollama-compatible completion client. The runtime owns the timeout; this
/// client only shapes the request.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("building llm http client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let mut request = self.http.post(&url).json(&GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.context("llm request failed")?;
        let response = response.error_for_status().context("llm returned an error status")?;
        let body: GenerateResponse =
            response.json().await.context("llm response body was not valid json")?;
        Ok(body.response)
    }
}
