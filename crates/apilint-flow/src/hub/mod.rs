//! Upstream API Hub client.
//!
//! The hub is an external collaborator: the pipeline consumes its document
//! listings and raw document bytes but never owns them. [`ApiHubClient`] is
//! the seam; [`http::HttpHubClient`] talks to a real hub and
//! [`memory::InMemoryHub`] backs tests.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A package version as reported by the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Fully-qualified `version@revision` reference.
    pub version: String,
}

/// One document in a package version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubDocument {
    /// Stable file identifier.
    pub file_id: String,
    /// Slug used to address the file's raw bytes.
    pub slug: String,
    /// Declared api type (hub vocabulary, e.g. `openapi-3-0`).
    #[serde(rename = "type")]
    pub api_type: String,
    /// Display title, when the hub knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Client for the upstream API Hub.
///
/// All failures surface as typed [`Error::Hub`] values propagated upwards;
/// the workers convert them into task-local failures or lease lapses.
#[async_trait]
pub trait ApiHubClient: Send + Sync {
    /// Resolves a possibly-unqualified version to its `version@revision`.
    async fn get_version(&self, package_id: &str, version: &str) -> Result<VersionInfo>;

    /// Lists the documents in a `version@revision`.
    async fn get_version_documents(
        &self,
        package_id: &str,
        version_ref: &str,
    ) -> Result<Vec<HubDocument>>;

    /// Downloads the raw bytes of one document.
    async fn get_document_raw(
        &self,
        package_id: &str,
        version_ref: &str,
        slug: &str,
    ) -> Result<Vec<u8>>;
}

/// Formats a `version@revision` reference.
#[must_use]
pub fn version_ref(version: &str, revision: i32) -> String {
    format!("{version}@{revision}")
}

/// Splits a `version@revision` reference into its parts.
///
/// # Errors
///
/// Returns [`Error::InvalidRevisionFormat`] when the reference has no `@`
/// separator or the revision is not a positive integer.
pub fn parse_version_ref(value: &str) -> Result<(String, i32)> {
    let Some((version, revision)) = value.rsplit_once('@') else {
        return Err(Error::InvalidRevisionFormat {
            value: value.to_string(),
        });
    };

    let revision: i32 = revision.parse().map_err(|_| Error::InvalidRevisionFormat {
        value: value.to_string(),
    })?;
    if version.is_empty() || revision < 1 {
        return Err(Error::InvalidRevisionFormat {
            value: value.to_string(),
        });
    }

    Ok((version.to_string(), revision))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ref_formats() {
        assert_eq!(version_ref("1.0", 3), "1.0@3");
    }

    #[test]
    fn parse_version_ref_accepts_qualified_references() {
        assert_eq!(parse_version_ref("1.0@3").unwrap(), ("1.0".to_string(), 3));
        assert_eq!(
            parse_version_ref("2024-05@12").unwrap(),
            ("2024-05".to_string(), 12)
        );
    }

    #[test]
    fn parse_version_ref_rejects_malformed_references() {
        for bad in ["1.0", "1.0@", "1.0@zero", "@3", "1.0@0", "1.0@-1"] {
            assert!(
                matches!(
                    parse_version_ref(bad),
                    Err(Error::InvalidRevisionFormat { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn hub_document_deserializes_hub_vocabulary() {
        let doc: HubDocument = serde_json::from_str(
            r#"{"fileId": "f1", "slug": "petstore", "type": "openapi-3-0", "title": "Petstore"}"#,
        )
        .unwrap();
        assert_eq!(doc.api_type, "openapi-3-0");
        assert_eq!(doc.title.as_deref(), Some("Petstore"));
    }
}
