//! JSON schemas structures for serde deserialization of the upstream documents.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;


// ================== //
//  VERSION MANIFEST  //
// ================== //

/// The upstream catalog of all available versions.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct VersionManifest {
    /// Aliases for the latest release and snapshot version ids.
    pub latest: VersionManifestLatest,
    /// All known versions, in upstream order.
    pub versions: Vec<VersionEntry>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct VersionManifestLatest {
    pub release: String,
    pub snapshot: String,
}

/// A single version entry of the manifest, pointing to its version descriptor.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub id: String,
    /// The version type, such as 'release' or 'snapshot'. Upstream adds kinds over
    /// time so this is kept as an opaque string.
    pub r#type: String,
    /// URL to the version descriptor JSON document.
    pub url: String,
    pub release_time: DateTime<FixedOffset>,
    #[serde(default)]
    pub sha1: Option<String>,
}


// =================== //
//  VERSION DESCRIPTOR //
// =================== //

/// A per-version metadata JSON schema, stored as `versions/<id>/<id>.json`.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    /// The version id, should be the same as the directory the descriptor is in.
    pub id: String,
    /// The version type, such as 'release' or 'snapshot'.
    pub r#type: String,
    pub release_time: DateTime<FixedOffset>,
    /// The full class name to run as the main JVM class.
    pub main_class: String,
    /// The asset index to use when launching the game, with download information.
    pub asset_index: AssetIndexRef,
    /// A mapping of downloads for entry point JAR files, the "client" key is the
    /// one used for launching.
    #[serde(default)]
    pub downloads: HashMap<String, Artifact>,
    /// The sequence of JAR libraries to include in the class path when running the
    /// version, the order of libraries should be respected in the class path.
    #[serde(default)]
    pub libraries: Vec<Library>,
}

/// Reference to the asset index document of a version.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssetIndexRef {
    pub id: String,
    #[serde(flatten)]
    pub download: Artifact,
}

/// A library of a version descriptor.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    /// Maven-style coordinate of the library, informational here because download
    /// paths come from the artifacts themselves.
    pub name: String,
    #[serde(default)]
    pub downloads: LibraryDownloads,
    /// Mapping from host OS name (windows/linux/osx) to the classifier of the
    /// platform-specific native artifact. Absent means no natives at all.
    #[serde(default)]
    pub natives: Option<HashMap<String, String>>,
    /// Admission rules, absent or empty means unconditionally admitted.
    #[serde(default)]
    pub rules: Option<Vec<Rule>>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDownloads {
    /// The main JAR artifact, absent for native-only libraries.
    #[serde(default)]
    pub artifact: Option<Artifact>,
    /// Secondary artifacts by classifier, used for platform natives.
    #[serde(default)]
    pub classifiers: HashMap<String, Artifact>,
}

/// Download information of a single file. This single record is used in multiple
/// roles: library artifacts and native classifiers (with a maven `path`), the
/// client JAR and the asset index document (without one).
#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Maven-style relative path, used under the libraries directory and, when the
    /// URL is absent or relative, against the default libraries endpoint.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Lowercase hex SHA-1 of the file content.
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}


// ================== //
//    ASSET INDEX     //
// ================== //

/// An asset index document, mapping logical asset names to content hashes.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct AssetIndex {
    /// Mapping of assets from their logical path to their object information, kept
    /// in document order.
    pub objects: IndexMap<String, AssetObject>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct AssetObject {
    /// Lowercase hex SHA-1 of the object, also its storage address.
    pub hash: String,
    pub size: u64,
}


// ================== //
//       RULES        //
// ================== //

/// A library admission rule.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub action: RuleAction,
    #[serde(default)]
    pub os: RuleOs,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RuleOs {
    pub name: Option<String>,
    pub arch: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Disallow,
}
