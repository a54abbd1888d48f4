use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{AdapterError, AdapterSettings, Result};

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Paced JSON-RPC 2.0 transport shared by the account-model adapters
pub(crate) struct JsonRpcClient {
    http_client: Client,
    api_url: String,
    api_key: Option<String>,
    request_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl JsonRpcClient {
    pub(crate) fn new(settings: &AdapterSettings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;
        Ok(Self {
            http_client,
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
            request_delay: Duration::from_millis(settings.request_delay_ms),
            last_request: Mutex::new(None),
        })
    }

    /// One JSON-RPC call; `Ok(None)` means the node answered without a result
    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        self.pace().await;

        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let mut request = self.http_client.post(&self.api_url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimit);
        }
        if !status.is_success() {
            return Err(AdapterError::Indexer {
                message: format!("HTTP {} from {}", status, self.api_url),
            });
        }

        let envelope: RpcEnvelope<T> = response.json().await?;
        if let Some(error) = envelope.error {
            return Err(AdapterError::Indexer {
                message: format!("RPC error {}: {}", error.code, error.message),
            });
        }
        Ok(envelope.result)
    }

    /// Spaces requests out so consecutive calls respect the configured delay
    async fn pace(&self) {
        if self.request_delay.is_zero() {
            return;
        }

        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.request_delay {
                tokio::time::sleep(self.request_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
