//! Reconciliation over HTTP.

use async_trait::async_trait;
use parley_protocol::{ReconcileRequest, ReconcileResponse};

use super::{ReconciliationFetcher, SyncError};

/// Posts reconciliation requests to `/api/reconcile`.
#[derive(Clone)]
pub struct HttpReconciliationFetcher {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpReconciliationFetcher {
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/reconcile", self.base_url)
    }
}

#[async_trait]
impl ReconciliationFetcher for HttpReconciliationFetcher {
    async fn fetch(&self, request: ReconcileRequest) -> Result<ReconcileResponse, SyncError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::Fetch(format!("sending request to server: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Fetch(format!("server returned {status}: {body}")));
        }

        response
            .json::<ReconcileResponse>()
            .await
            .map_err(|e| SyncError::Fetch(format!("invalid response body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let fetcher = HttpReconciliationFetcher::new("http://localhost:8480/", "t");
        assert_eq!(fetcher.endpoint(), "http://localhost:8480/api/reconcile");
    }
}
