//! Text extraction via the external extractor service.

use async_trait::async_trait;

use crate::rag::RagError;

/// Turns an uploaded document into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String, RagError>;
}

/// Tika-style HTTP extractor: PUT the raw document, get text back.
pub struct HttpExtractor {
    base_url: String,
    http: reqwest::Client,
}

impl HttpExtractor {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TextExtractor for HttpExtractor {
    async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String, RagError> {
        let url = format!("{}/tika", self.base_url);
        let response = self
            .http
            .put(&url)
            .header(reqwest::header::ACCEPT, "text/plain")
            .header(
                reqwest::header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            )
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| RagError::Extractor(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::Extractor(format!(
                "extractor returned {status} for {filename:?}"
            )));
        }
        response
            .text()
            .await
            .map_err(|e| RagError::Extractor(e.to_string()))
    }
}
