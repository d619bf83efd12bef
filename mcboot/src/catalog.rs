//! Version catalog: enumeration of locally installed versions and of the versions
//! published on the official manifest endpoint, with a process-wide cache of the
//! remote manifest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::io;

use chrono::{DateTime, FixedOffset};
use once_cell::sync::Lazy;

use crate::engine::serde::{VersionDescriptor, VersionManifest};
use crate::engine::{Error, Result};
use crate::path::PathExt;
use crate::layout;


/// Static URL to the version manifest provided by Mojang.
pub const VERSION_MANIFEST_URL: &str = "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";

/// The single key used in the process-wide manifest cache.
const MANIFEST_CACHE_KEY: &str = "main";

/// Cached manifest entries expire this long after insertion.
const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Process-wide manifest cache. Concurrent callers may race to populate it, the
/// last writer wins and duplicate fetches are harmless.
static MANIFEST_CACHE: Lazy<Mutex<HashMap<&'static str, CachedManifest>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone)]
struct CachedManifest {
    inserted: Instant,
    url: Box<str>,
    manifest: Arc<VersionManifest>,
}


/// A version known to the catalog, either installed locally or published upstream.
#[derive(Debug, Clone)]
pub struct McVersion {
    pub id: String,
    /// The version type, such as 'release' or 'snapshot'.
    pub r#type: String,
    pub release_time: DateTime<FixedOffset>,
    /// URL of the version descriptor, none for local versions.
    pub url: Option<String>,
    /// True if the version descriptor is present on disk.
    pub local: bool,
    /// Path of the local descriptor document, if local.
    pub local_path: Option<PathBuf>,
}

/// Fetch the remote version manifest, going through the process-wide cache. A
/// time-valid cached manifest is returned without any network access.
pub async fn fetch_manifest() -> Result<Arc<VersionManifest>> {
    fetch_manifest_at(VERSION_MANIFEST_URL).await
}

/// Same as [`fetch_manifest`] with an explicit endpoint, for mirrors and tests.
/// The cache slot remembers which endpoint filled it, so switching endpoints
/// invalidates it.
pub async fn fetch_manifest_at(url: &str) -> Result<Arc<VersionManifest>> {

    {
        let cache = MANIFEST_CACHE.lock().unwrap();
        if let Some(cached) = cache.get(MANIFEST_CACHE_KEY) {
            if &*cached.url == url && cached.inserted.elapsed() < MANIFEST_CACHE_TTL {
                return Ok(Arc::clone(&cached.manifest));
            }
        }
    }

    let res = crate::http::client()?
        .get(url)
        .send().await?
        .error_for_status()?;

    let text = res.text().await?;

    let mut deserializer = serde_json::Deserializer::from_str(&text);
    let manifest = serde_path_to_error::deserialize::<_, VersionManifest>(&mut deserializer)
        .map_err(|e| Error::new_json_url(e, url))?;

    let manifest = Arc::new(manifest);

    MANIFEST_CACHE.lock().unwrap().insert(MANIFEST_CACHE_KEY, CachedManifest {
        inserted: Instant::now(),
        url: url.into(),
        manifest: Arc::clone(&manifest),
    });

    Ok(manifest)

}

/// List the versions installed under `mc_dir/versions`, in directory scan order.
/// A version is local when `<name>/<name>.json` exists and parses; descriptors
/// that fail to parse are logged and skipped.
pub async fn local_versions(mc_dir: &Path) -> Result<Vec<McVersion>> {

    let versions_dir = layout::versions_dir(mc_dir);

    let mut read_dir = match tokio::fs::read_dir(&versions_dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::new_io_file(e, versions_dir)),
    };

    let mut versions = Vec::new();

    while let Some(entry) = read_dir.next_entry().await
        .map_err(|e| Error::new_io_file(e, versions_dir.clone()))? {

        let dir = entry.path();
        match entry.file_type().await {
            Ok(file_type) if file_type.is_dir() => (),
            _ => continue,
        }

        let Some(name) = dir.file_name().and_then(|name| name.to_str()).map(str::to_string) else {
            continue;
        };

        let file = dir.join_with_extension(&name, "json");
        let content = match tokio::fs::read_to_string(&file).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                log::warn!("skipping local version {name}: {e}");
                continue;
            }
        };

        let mut deserializer = serde_json::Deserializer::from_str(&content);
        let descriptor = match serde_path_to_error::deserialize::<_, VersionDescriptor>(&mut deserializer) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::warn!("skipping local version {name}: {e}");
                continue;
            }
        };

        versions.push(McVersion {
            id: descriptor.id,
            r#type: descriptor.r#type,
            release_time: descriptor.release_time,
            url: None,
            local: true,
            local_path: Some(file),
        });

    }

    Ok(versions)

}

/// List the versions published on the official manifest, in upstream order.
pub async fn remote_versions() -> Result<Vec<McVersion>> {
    let manifest = fetch_manifest().await?;
    Ok(manifest.versions.iter()
        .map(|entry| McVersion {
            id: entry.id.clone(),
            r#type: entry.r#type.clone(),
            release_time: entry.release_time,
            url: Some(entry.url.clone()),
            local: false,
            local_path: None,
        })
        .collect())
}

/// List every version available for installation: local versions first in scan
/// order, then remote versions whose id is not shadowed by a local one, in
/// upstream order. A remote fetch failure degrades to the local list only.
pub async fn available_versions(mc_dir: &Path) -> Result<Vec<McVersion>> {

    let mut versions = local_versions(mc_dir).await?;

    match remote_versions().await {
        Ok(remotes) => {
            for version in remotes {
                if !versions.iter().any(|local| local.id == version.id) {
                    versions.push(version);
                }
            }
        }
        Err(e) => {
            log::warn!("remote version manifest unavailable, listing local versions only: {e}");
        }
    }

    Ok(versions)

}


#[cfg(test)]
mod tests {

    use super::*;

    use std::fs;

    #[tokio::test]
    async fn local_versions_scan() {

        let dir = tempfile::tempdir().unwrap();
        let versions_dir = dir.path().join("versions");

        // No versions directory at all is an empty list.
        assert!(local_versions(dir.path()).await.unwrap().is_empty());

        // One well-formed version, one directory without descriptor, one malformed.
        let good = versions_dir.join("1.20.1");
        fs::create_dir_all(&good).unwrap();
        fs::write(good.join("1.20.1.json"), serde_json::json!({
            "id": "1.20.1",
            "type": "release",
            "releaseTime": "2023-06-12T13:25:51+00:00",
            "mainClass": "net.minecraft.client.main.Main",
            "assetIndex": {
                "id": "5",
                "url": "https://example.com/5.json",
            },
        }).to_string()).unwrap();

        fs::create_dir_all(versions_dir.join("empty-dir")).unwrap();

        let bad = versions_dir.join("corrupt");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("corrupt.json"), "{ not json").unwrap();

        let versions = local_versions(dir.path()).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id, "1.20.1");
        assert_eq!(versions[0].r#type, "release");
        assert!(versions[0].local);
        assert!(versions[0].url.is_none());
        assert_eq!(versions[0].local_path.as_deref(), Some(&*good.join("1.20.1.json")));

    }

}
