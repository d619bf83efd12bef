//! On-disk layout of an installation: mapping logical identifiers to paths and
//! provisioning the standard directory tree.

use std::io;
use std::path::{Path, PathBuf};

use crate::engine::LaunchConfig;
use crate::path::{PathExt, PathBufExt};


/// Return the default main directory for Minecraft, so called ".minecraft".
pub fn default_main_dir() -> Option<PathBuf> {
    if cfg!(target_os = "windows") {
        dirs::data_dir().map(|dir| dir.joined(".minecraft"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir().map(|dir| dir.joined("minecraft"))
    } else {
        dirs::home_dir().map(|dir| dir.joined(".minecraft"))
    }
}

/// The directory containing one subdirectory per installed version.
#[inline]
pub fn versions_dir(mc_dir: &Path) -> PathBuf {
    mc_dir.join("versions")
}

/// The directory of a single version, holding its descriptor and client JAR.
#[inline]
pub fn version_dir(mc_dir: &Path, id: &str) -> PathBuf {
    versions_dir(mc_dir).joined(id)
}

/// Path of the version descriptor document, `versions/<id>/<id>.json`.
#[inline]
pub fn version_json_file(mc_dir: &Path, id: &str) -> PathBuf {
    version_dir(mc_dir, id).join_with_extension(id, "json")
}

/// Path of the client JAR, `versions/<id>/<id>.jar`.
#[inline]
pub fn version_jar_file(mc_dir: &Path, id: &str) -> PathBuf {
    version_dir(mc_dir, id).join_with_extension(id, "jar")
}

/// Path of an asset index document, `indexes/<id>.json` under the assets dir.
#[inline]
pub fn asset_index_file(assets_dir: &Path, id: &str) -> PathBuf {
    assets_dir.join("indexes").join_with_extension(id, "json")
}

/// Storage path of an asset object, addressed by its content hash as
/// `objects/<hash[0:2]>/<hash>` under the assets dir.
#[inline]
pub fn asset_object_file(assets_dir: &Path, hash: &str) -> PathBuf {
    assets_dir.join("objects").joined(&hash[..2]).joined(hash)
}

/// Local file of a library artifact from its maven-style relative path.
#[inline]
pub fn library_file(libraries_dir: &Path, maven_path: &str) -> PathBuf {
    libraries_dir.join(maven_path)
}

/// Provision the standard directory tree of an installation, idempotent.
pub async fn ensure_dirs(config: &LaunchConfig) -> io::Result<()> {
    tokio::fs::create_dir_all(config.mc_dir()).await?;
    tokio::fs::create_dir_all(versions_dir(config.mc_dir())).await?;
    tokio::fs::create_dir_all(config.libraries_dir()).await?;
    tokio::fs::create_dir_all(config.assets_dir()).await?;
    tokio::fs::create_dir_all(config.assets_dir().join("indexes")).await?;
    tokio::fs::create_dir_all(config.assets_dir().join("objects")).await?;
    Ok(())
}

/// Ensure that the parent directory of a leaf file exists.
pub async fn ensure_parent(file: &Path) -> io::Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn version_files_under_versions_dir() {
        let mc_dir = Path::new("/mc");
        assert_eq!(version_json_file(mc_dir, "1.20.1"), Path::new("/mc/versions/1.20.1/1.20.1.json"));
        assert_eq!(version_jar_file(mc_dir, "1.20.1"), Path::new("/mc/versions/1.20.1/1.20.1.jar"));
    }

    #[test]
    fn asset_object_hash_prefix() {
        let assets_dir = Path::new("/mc/assets");
        let hash = "00a1bc3221ec5a88b00f89991f8ba1370a0a9e29";
        assert_eq!(
            asset_object_file(assets_dir, hash),
            Path::new("/mc/assets/objects/00/00a1bc3221ec5a88b00f89991f8ba1370a0a9e29"),
        );
    }

}
