//! Smiley cache
//!
//! The rendered markdown references forum smileys by short names. In `web`
//! mode the view route redirects to the forum's own image servers; in `local`
//! mode images are fetched once and cached under `smile/` in the topic root.
//! Failed downloads are negatively cached so a dead smiley does not retry on
//! every page view.

use crate::collection::SyncMap;
use crate::error::{Error, Result};
use crate::sandbox::RootDir;
use serde::Deserialize;
use std::sync::Arc;

/// Embedded smiley manifest
const SMILES_JSON: &str = include_str!("../assets/smiles.json");

/// One manifest entry
#[derive(Clone, Debug, Deserialize)]
pub struct SmileItem {
    /// Short name referenced from markdown
    pub name: String,
    /// Path on the forum image server (also the local cache path)
    pub path: String,
    /// Optional name prefix for families sharing a suffix
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    base: String,
    list: Vec<SmileItem>,
}

/// Smiley resolver and local cache
pub struct Smile {
    manifest: Manifest,
    root: RootDir,
    /// Resolved name → manifest entry
    cache: SyncMap<String, Arc<SmileItem>>,
    /// Names whose download already failed
    failed: SyncMap<String, ()>,
    client: reqwest::Client,
}

impl Smile {
    /// Load the embedded manifest, caching under `smile/` in `topic_root`.
    pub fn open(topic_root: &RootDir) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(SMILES_JSON)?;
        Ok(Self {
            manifest,
            root: topic_root.open_sub("smile")?,
            cache: SyncMap::new(),
            failed: SyncMap::new(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()?,
        })
    }

    fn find(&self, name: &str) -> Option<Arc<SmileItem>> {
        if let Some(item) = self.cache.get(&name.to_string()) {
            return Some(item);
        }
        let short = name.split('/').next().unwrap_or(name);
        let found = self.manifest.list.iter().find(|item| {
            if item.path == name {
                return true;
            }
            if item.prefix.is_empty() {
                item.name == short
            } else {
                short.starts_with(&item.prefix) && short.ends_with(&item.name)
            }
        })?;
        let item = Arc::new(found.clone());
        self.cache.put(name.to_string(), item.clone());
        Some(item)
    }

    /// The remote URL of a smiley, for `web` mode redirects.
    pub fn url(&self, name: &str) -> Option<String> {
        let item = self.find(name)?;
        Some(format!("{}{}", self.manifest.base, item.path))
    }

    /// The smiley bytes from the local cache, downloading on first use.
    pub async fn local(&self, name: &str, ua: &str) -> Result<Vec<u8>> {
        let item = self
            .find(name)
            .ok_or_else(|| Error::Other(format!("smile {name} not found")))?;

        if self.root.is_exist(&item.path) {
            return self.root.read_all(&item.path);
        }
        if self.failed.has(&name.to_string()) {
            return Err(Error::Other(format!("smile {name} download failed before")));
        }

        let url = format!("{}{}", self.manifest.base, item.path);
        match self.fetch(&url, ua).await {
            Ok(bytes) => {
                self.root.write_all(&item.path, &bytes)?;
                tracing::debug!(name, url, "cached smiley");
                Ok(bytes)
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "smiley download failed");
                self.failed.put(name.to_string(), ());
                Err(e)
            }
        }
    }

    async fn fetch(&self, url: &str, ua: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .header("User-Agent", ua)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Other(format!("smiley fetch {url} returned {status}")));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn smile() -> (tempfile::TempDir, Smile) {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        let smile = Smile::open(&root).unwrap();
        (dir, smile)
    }

    #[test]
    fn test_manifest_parses_and_resolves_by_name() {
        let (_tmp, smile) = smile();
        let url = smile.url("ac0").expect("ac0 is in the embedded manifest");
        assert!(url.starts_with("http"));
        assert!(url.contains("ac0"));
    }

    #[test]
    fn test_unknown_name_is_none() {
        let (_tmp, smile) = smile();
        assert!(smile.url("definitely-not-a-smiley").is_none());
    }

    #[test]
    fn test_prefix_family_match() {
        let (_tmp, smile) = smile();
        // `a2:goodjob` style names resolve through the prefix rule.
        assert!(smile.url("a2_goodjob").is_some());
    }
}
