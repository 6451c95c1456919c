//! In-memory API Hub for testing.
//!
//! Holds scripted versions, document listings, and raw bytes, plus
//! injectable failures so workers' error paths can be exercised without a
//! network.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{ApiHubClient, HubDocument, VersionInfo};

#[derive(Debug, Default)]
struct Inner {
    /// (package, unqualified version) -> qualified `version@revision`.
    versions: HashMap<(String, String), String>,
    /// (package, version ref) -> document listing.
    documents: HashMap<(String, String), Vec<HubDocument>>,
    /// (package, version ref, slug) -> raw bytes.
    raw: HashMap<(String, String, String), Vec<u8>>,
    /// Slugs whose raw download should fail.
    failing_slugs: HashSet<String>,
}

/// In-memory hub for tests.
#[derive(Debug, Default)]
pub struct InMemoryHub {
    inner: RwLock<Inner>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::hub("hub lock poisoned")
}

impl InMemoryHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a version resolution for `get_version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_version(
        &self,
        package_id: &str,
        version: &str,
        qualified_ref: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.versions.insert(
            (package_id.to_string(), version.to_string()),
            qualified_ref.to_string(),
        );
        Ok(())
    }

    /// Registers a document with its raw bytes under a version reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_document(
        &self,
        package_id: &str,
        version_ref: &str,
        document: HubDocument,
        raw: Vec<u8>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner
            .raw
            .insert(
                (
                    package_id.to_string(),
                    version_ref.to_string(),
                    document.slug.clone(),
                ),
                raw,
            );
        inner
            .documents
            .entry((package_id.to_string(), version_ref.to_string()))
            .or_default()
            .push(document);
        Ok(())
    }

    /// Makes raw downloads for `slug` fail with a hub error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_raw_download(&self, slug: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.failing_slugs.insert(slug.to_string());
        Ok(())
    }
}

#[async_trait]
impl ApiHubClient for InMemoryHub {
    async fn get_version(&self, package_id: &str, version: &str) -> Result<VersionInfo> {
        let inner = self.inner.read().map_err(poison_err)?;
        inner
            .versions
            .get(&(package_id.to_string(), version.to_string()))
            .map(|qualified| VersionInfo {
                version: qualified.clone(),
            })
            .ok_or_else(|| Error::hub(format!("unknown version {package_id}/{version}")))
    }

    async fn get_version_documents(
        &self,
        package_id: &str,
        version_ref: &str,
    ) -> Result<Vec<HubDocument>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .documents
            .get(&(package_id.to_string(), version_ref.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_document_raw(
        &self,
        package_id: &str,
        version_ref: &str,
        slug: &str,
    ) -> Result<Vec<u8>> {
        let inner = self.inner.read().map_err(poison_err)?;
        if inner.failing_slugs.contains(slug) {
            return Err(Error::hub(format!("download of {slug} failed")));
        }
        inner
            .raw
            .get(&(
                package_id.to_string(),
                version_ref.to_string(),
                slug.to_string(),
            ))
            .cloned()
            .ok_or_else(|| Error::hub(format!("unknown document {slug}")))
    }
}
