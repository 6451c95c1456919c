//! HTTP implementation of the API Hub client.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};

use super::{ApiHubClient, HubDocument, VersionInfo};

/// Talks to a real API Hub over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHubClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DocumentListResponse {
    #[serde(default)]
    documents: Vec<HubDocument>,
}

impl HttpHubClient {
    /// Creates a client for the hub at `base_url`.
    ///
    /// A bearer `token`, when provided, is attached to every request.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, url: String) -> Result<reqwest::Response> {
        let response = self
            .request(url.clone())
            .send()
            .await
            .map_err(|e| Error::hub_with_source(format!("request to {url} failed"), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::hub(format!("{url} returned {status}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ApiHubClient for HttpHubClient {
    async fn get_version(&self, package_id: &str, version: &str) -> Result<VersionInfo> {
        let url = format!(
            "{}/api/v2/packages/{package_id}/versions/{version}",
            self.base_url
        );
        self.send(url.clone())
            .await?
            .json::<VersionInfo>()
            .await
            .map_err(|e| Error::hub_with_source(format!("decoding {url}"), e))
    }

    async fn get_version_documents(
        &self,
        package_id: &str,
        version_ref: &str,
    ) -> Result<Vec<HubDocument>> {
        let url = format!(
            "{}/api/v2/packages/{package_id}/versions/{version_ref}/documents",
            self.base_url
        );
        let body = self
            .send(url.clone())
            .await?
            .json::<DocumentListResponse>()
            .await
            .map_err(|e| Error::hub_with_source(format!("decoding {url}"), e))?;
        Ok(body.documents)
    }

    async fn get_document_raw(
        &self,
        package_id: &str,
        version_ref: &str,
        slug: &str,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/api/v2/packages/{package_id}/versions/{version_ref}/files/{slug}/raw",
            self.base_url
        );
        let bytes = self
            .send(url.clone())
            .await?
            .bytes()
            .await
            .map_err(|e| Error::hub_with_source(format!("reading {url}"), e))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = HttpHubClient::new("https://hub.example.com/", None);
        assert_eq!(client.base_url, "https://hub.example.com");
    }
}
