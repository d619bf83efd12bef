//! The bootstrap engine: diffing a local installation against the official
//! distribution metadata, downloading what is missing and launching the game.
//!
//! The central type is [`Engine`], a state machine around a [`LaunchState`]:
//! `init` diffs the installation, `download` runs a concurrent download session
//! observed through a [`DownloadState`], `run` spawns the game process. After a
//! download session the engine re-runs `init` so that disk state stays the single
//! source of truth.

pub mod serde;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::ffi::OsString;
use std::{env, io};

use indexmap::{IndexMap, IndexSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::download::{self, Batch, Entry, EntryErrorKind};
use crate::{catalog, layout, rules};


/// Base URL for downloading game's assets.
pub(crate) const RESOURCES_URL: &str = "https://resources.download.minecraft.net/";

/// Base URL for libraries.
pub(crate) const LIBRARIES_URL: &str = "https://libraries.minecraft.net/";

/// The offline-profile access token accepted by vanilla clients.
const OFFLINE_ACCESS_TOKEN: &str = "0";


/// Configuration of a launch, immutable once the engine is constructed. The
/// version descriptor and client JAR paths are derived from the main directory and
/// version id, so they always resolve under `mc_dir/versions/<version_id>/`.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    username: String,
    version_id: String,
    mc_dir: PathBuf,
    libraries_dir: PathBuf,
    assets_dir: PathBuf,
    version_json_path: PathBuf,
    version_jar_path: PathBuf,
    max_memory_mb: u32,
    min_memory_mb: u32,
    jvm_args: IndexMap<String, String>,
    game_args: IndexMap<String, String>,
    manifest_url: String,
    libraries_url: String,
    resources_url: String,
}

impl LaunchConfig {

    /// Create a new configuration for the given player name, version id and main
    /// directory, deriving the standard sub directories from the main one.
    pub fn new(username: impl Into<String>, version_id: impl Into<String>, mc_dir: impl Into<PathBuf>) -> Self {

        let username = username.into();
        let version_id = version_id.into();
        let mc_dir = mc_dir.into();

        Self {
            libraries_dir: mc_dir.join("libraries"),
            assets_dir: mc_dir.join("assets"),
            version_json_path: layout::version_json_file(&mc_dir, &version_id),
            version_jar_path: layout::version_jar_file(&mc_dir, &version_id),
            username,
            version_id,
            mc_dir,
            max_memory_mb: 2048,
            min_memory_mb: 512,
            jvm_args: IndexMap::new(),
            game_args: IndexMap::new(),
            manifest_url: catalog::VERSION_MANIFEST_URL.to_string(),
            libraries_url: LIBRARIES_URL.to_string(),
            resources_url: RESOURCES_URL.to_string(),
        }

    }

    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[inline]
    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    /// The main directory, also the working directory of the game process.
    #[inline]
    pub fn mc_dir(&self) -> &Path {
        &self.mc_dir
    }

    /// The directory where libraries are stored, organized like a maven repository.
    #[inline]
    pub fn libraries_dir(&self) -> &Path {
        &self.libraries_dir
    }

    /// See [`Self::libraries_dir`].
    #[inline]
    pub fn set_libraries_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.libraries_dir = dir.into();
        self
    }

    /// The directory where assets and asset indexes are stored.
    #[inline]
    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    /// See [`Self::assets_dir`].
    #[inline]
    pub fn set_assets_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.assets_dir = dir.into();
        self
    }

    /// Path of the version descriptor document of the configured version.
    #[inline]
    pub fn version_json_path(&self) -> &Path {
        &self.version_json_path
    }

    /// Path of the client JAR of the configured version.
    #[inline]
    pub fn version_jar_path(&self) -> &Path {
        &self.version_jar_path
    }

    /// Maximum JVM heap size in MiB, defaults to 2048.
    #[inline]
    pub fn max_memory_mb(&self) -> u32 {
        self.max_memory_mb
    }

    /// See [`Self::max_memory_mb`].
    #[inline]
    pub fn set_max_memory_mb(&mut self, mb: u32) -> &mut Self {
        self.max_memory_mb = mb;
        self
    }

    /// Minimum JVM heap size in MiB, defaults to 512.
    #[inline]
    pub fn min_memory_mb(&self) -> u32 {
        self.min_memory_mb
    }

    /// See [`Self::min_memory_mb`].
    #[inline]
    pub fn set_min_memory_mb(&mut self, mb: u32) -> &mut Self {
        self.min_memory_mb = mb;
        self
    }

    /// Add a custom JVM argument, emitted before the class path in insertion
    /// order. An empty value emits the flag alone.
    pub fn add_jvm_arg(&mut self, flag: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.jvm_args.insert(flag.into(), value.into());
        self
    }

    /// Add a custom game argument, emitted after the standard game arguments in
    /// insertion order. An empty value emits the flag alone.
    pub fn add_game_arg(&mut self, flag: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.game_args.insert(flag.into(), value.into());
        self
    }

    /// Override the version manifest endpoint, for mirrors and tests.
    #[inline]
    pub fn set_manifest_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.manifest_url = url.into();
        self
    }

    /// Override the default libraries endpoint, used for library artifacts whose
    /// URL is absent or relative. For mirrors and tests.
    #[inline]
    pub fn set_libraries_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.libraries_url = ensure_trailing_slash(url.into());
        self
    }

    /// Override the default asset objects endpoint. For mirrors and tests.
    #[inline]
    pub fn set_resources_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.resources_url = ensure_trailing_slash(url.into());
        self
    }

}

fn ensure_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}


/// Sentinel for one of the three single files an installation can miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingFile {
    VersionJson,
    AssetIndex,
    ClientJar,
}

impl MissingFile {

    pub fn as_str(self) -> &'static str {
        match self {
            MissingFile::VersionJson => "version.json",
            MissingFile::AssetIndex => "asset_index",
            MissingFile::ClientJar => "client.jar",
        }
    }

}

/// The diffed state of an installation, reset on every `init`. Readers get a
/// snapshot through [`Engine::state`], every mutation happens under the engine's
/// state mutex.
#[derive(Debug, Clone, Default)]
pub struct LaunchState {
    initialized: bool,
    can_launch: bool,
    missing_files: IndexSet<MissingFile>,
    missing_libraries: IndexSet<String>,
    missing_assets: IndexSet<String>,
    status_message: String,
    last_error: Option<String>,
}

impl LaunchState {

    /// True after a successful `init`, false after a failed one.
    #[inline]
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// True when initialized and nothing is missing.
    #[inline]
    pub fn can_launch(&self) -> bool {
        self.can_launch
    }

    /// The missing single-file sentinels, in recording order.
    #[inline]
    pub fn missing_files(&self) -> &IndexSet<MissingFile> {
        &self.missing_files
    }

    /// The maven paths of missing library artifacts, in descriptor order.
    #[inline]
    pub fn missing_libraries(&self) -> &IndexSet<String> {
        &self.missing_libraries
    }

    /// The logical names of missing assets, in index order.
    #[inline]
    pub fn missing_assets(&self) -> &IndexSet<String> {
        &self.missing_assets
    }

    /// Total number of missing items.
    #[inline]
    pub fn total_missing(&self) -> usize {
        self.missing_files.len() + self.missing_libraries.len() + self.missing_assets.len()
    }

    /// True if a download session is needed before launching.
    #[inline]
    pub fn needs_download(&self) -> bool {
        self.total_missing() > 0
    }

    /// A human-readable description of the current state.
    #[inline]
    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    /// The rendered error captured by the last failed `init` or `download`, if
    /// any.
    #[inline]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Recompute the launchability invariant after a mutation.
    fn update_can_launch(&mut self) {
        self.can_launch = self.initialized && self.total_missing() == 0;
        self.status_message = if self.can_launch {
            "ready to launch".to_string()
        } else if self.initialized {
            format!("{} files missing", self.total_missing())
        } else {
            self.status_message.clone()
        };
    }

}

/// Terminal and non-terminal statuses of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Initializing,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {

    /// True for statuses that end a session.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

}

/// Observable state of a single download session, created fresh by every call to
/// [`Engine::download`]. Counters are monotonic for the session lifetime and the
/// current file is last-writer-wins.
#[derive(Debug)]
pub struct DownloadState {
    total_files: AtomicU32,
    completed_files: AtomicU32,
    failed_files: AtomicU32,
    current_file: Mutex<String>,
    status: Mutex<DownloadStatus>,
    cancelled: AtomicBool,
    done: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadState {

    fn new() -> Self {
        Self {
            total_files: AtomicU32::new(0),
            completed_files: AtomicU32::new(0),
            failed_files: AtomicU32::new(0),
            current_file: Mutex::new(String::new()),
            status: Mutex::new(DownloadStatus::Initializing),
            cancelled: AtomicBool::new(false),
            done: Notify::new(),
            task: Mutex::new(None),
        }
    }

    #[inline]
    pub fn total_files(&self) -> u32 {
        self.total_files.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn completed_files(&self) -> u32 {
        self.completed_files.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn failed_files(&self) -> u32 {
        self.failed_files.load(Ordering::Relaxed)
    }

    /// The file most recently reported by a worker.
    pub fn current_file(&self) -> String {
        self.current_file.lock().unwrap().clone()
    }

    pub fn status(&self) -> DownloadStatus {
        *self.status.lock().unwrap()
    }

    /// Wait until the session reaches a terminal status, which is then returned.
    pub async fn wait(&self) -> DownloadStatus {
        loop {
            let notified = self.done.notified();
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            notified.await;
        }
    }

    /// Cancel the session. The session task is aborted, in-flight transfers are
    /// dropped and their results discarded, so partial files may remain on disk. A
    /// later `init` re-establishes the truth against disk.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.try_set_status(DownloadStatus::Cancelled);
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn set_current_file(&self, name: &str) {
        let mut current_file = self.current_file.lock().unwrap();
        current_file.clear();
        current_file.push_str(name);
    }

    /// Transition to the given status unless a terminal status was reached first,
    /// notifying waiters when the new status is terminal. Returns whether the
    /// transition happened.
    fn try_set_status(&self, status: DownloadStatus) -> bool {
        let mut guard = self.status.lock().unwrap();
        if guard.is_terminal() {
            return false;
        }
        *guard = status;
        drop(guard);
        if status.is_terminal() {
            self.done.notify_waiters();
        }
        true
    }

}

/// Observer of a download session. Methods are invoked synchronously on the tokio
/// worker that observed the state change and must not block nor take long-held
/// locks.
pub trait Handler: Send + 'static {

    /// The session transitioned to a new status.
    fn status_change(&mut self, status: DownloadStatus) {
        let _ = status;
    }

    /// Progress notification after a file finished, successfully or not.
    fn progress(&mut self, completed: u32, failed: u32, total: u32, current_file: &str) {
        let _ = (completed, failed, total, current_file);
    }

    /// The session failed with the given error.
    fn error(&mut self, error: &Error) {
        let _ = error;
    }

}

/// Blanket implementation that does nothing.
impl Handler for () { }


/// The bootstrap engine could not proceed.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration was rejected when constructing the engine.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        reason: &'static str,
    },
    /// An operation was invoked before the state it requires was reached.
    #[error("precondition not met: {reason}")]
    PreconditionNotMet {
        reason: &'static str,
    },
    /// The configured version id is not in the upstream manifest.
    #[error("version not found: {id}")]
    VersionNotFound {
        id: String,
    },
    /// A required document misses a field the bootstrap cannot proceed without.
    #[error("invalid descriptor: missing {what}")]
    InvalidDescriptor {
        what: &'static str,
    },
    /// A generic system's IO error with optional file source.
    #[error("io: {error} @ {file:?}")]
    Io {
        #[source]
        error: io::Error,
        file: Option<Box<Path>>,
    },
    /// A JSON deserialization error with its document source (file or URL).
    #[error("json: {error} @ {context}")]
    Json {
        #[source]
        error: serde_path_to_error::Error<serde_json::Error>,
        context: Box<str>,
    },
    /// A standalone reqwest error.
    #[error("reqwest: {error}")]
    Reqwest {
        #[from]
        error: reqwest::Error,
    },
    /// A required manifest, descriptor, index or client fetch failed.
    #[error("download: {0}")]
    Download(#[from] download::EntryError),
}

impl Error {

    #[inline]
    pub(crate) fn new_io(error: io::Error) -> Self {
        Self::Io { error, file: None }
    }

    #[inline]
    pub(crate) fn new_io_file(error: io::Error, file: impl Into<PathBuf>) -> Self {
        Self::Io { error, file: Some(file.into().into_boxed_path()) }
    }

    #[inline]
    pub(crate) fn new_json_file(error: serde_path_to_error::Error<serde_json::Error>, file: &Path) -> Self {
        Self::Json { error, context: file.display().to_string().into_boxed_str() }
    }

    #[inline]
    pub(crate) fn new_json_url(error: serde_path_to_error::Error<serde_json::Error>, url: &str) -> Self {
        Self::Json { error, context: url.into() }
    }

}

/// Type alias for a result with the engine error type.
pub type Result<T> = std::result::Result<T, Error>;


/// In-memory copies of the documents loaded by `init` or fetched by a download
/// session.
#[derive(Debug, Default)]
struct LoadedDocs {
    descriptor: Option<serde::VersionDescriptor>,
    asset_index: Option<serde::AssetIndex>,
}

/// The bootstrap engine. See the module documentation for the lifecycle.
#[derive(Debug)]
pub struct Engine {
    config: LaunchConfig,
    state: Mutex<LaunchState>,
    docs: Mutex<LoadedDocs>,
}

impl Engine {

    /// Create a new engine for the given configuration, validating it.
    pub fn new(config: LaunchConfig) -> Result<Self> {

        if config.username.is_empty() {
            return Err(Error::InvalidConfig { reason: "username is empty" });
        }

        if config.mc_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig { reason: "mc_dir is not set" });
        }

        if config.version_id.is_empty() {
            return Err(Error::InvalidConfig { reason: "version_id is empty" });
        }

        Ok(Self {
            config,
            state: Mutex::new(LaunchState::default()),
            docs: Mutex::new(LoadedDocs::default()),
        })

    }

    #[inline]
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Return a snapshot of the current launch state.
    pub fn state(&self) -> LaunchState {
        self.state.lock().unwrap().clone()
    }

    /// Run a mutation of the launch state under its mutex.
    fn with_state<R>(&self, func: impl FnOnce(&mut LaunchState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let ret = func(&mut state);
        state.update_can_launch();
        ret
    }

    /// Diff the installation against the configured version: provision the
    /// directory tree, load the local descriptor and asset index when present, and
    /// record every missing file into the launch state. On success the state is
    /// initialized and `can_launch` reflects whether anything is missing; on
    /// failure the error is also captured in the state and the state stays
    /// uninitialized.
    pub async fn init(&self) -> Result<()> {

        self.with_state(|state| {
            *state = LaunchState::default();
            state.status_message = "initializing".to_string();
        });

        match self.init_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.with_state(|state| {
                    state.initialized = false;
                    state.status_message = format!("initialization failed: {e}");
                    state.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }

    }

    async fn init_inner(&self) -> Result<()> {

        layout::ensure_dirs(&self.config).await
            .map_err(Error::new_io)?;

        let mut missing_files = IndexSet::new();
        let mut missing_libraries = IndexSet::new();
        let mut missing_assets = IndexSet::new();

        // Load the local version descriptor, if present.
        let descriptor = match read_json_file::<serde::VersionDescriptor>(&self.config.version_json_path).await? {
            Some(descriptor) => Some(descriptor),
            None => {
                missing_files.insert(MissingFile::VersionJson);
                None
            }
        };

        if !file_exists(&self.config.version_jar_path).await? {
            missing_files.insert(MissingFile::ClientJar);
        }

        // Load the local asset index, if the descriptor names one and it exists.
        let mut asset_index = None;
        match &descriptor {
            Some(descriptor) => {
                let index_file = layout::asset_index_file(&self.config.assets_dir, &descriptor.asset_index.id);
                match read_json_file::<serde::AssetIndex>(&index_file).await? {
                    Some(index) => asset_index = Some(index),
                    None => {
                        missing_files.insert(MissingFile::AssetIndex);
                    }
                }
            }
            None => {
                // Without a descriptor the index id is unknown, it can only be
                // fetched after the descriptor itself.
                missing_files.insert(MissingFile::AssetIndex);
            }
        }

        // Diff every admitted library artifact, natives included.
        if let Some(descriptor) = &descriptor {
            for artifact in library_artifacts(descriptor) {
                let file = layout::library_file(&self.config.libraries_dir, &artifact.path);
                if !file_exists(&file).await? {
                    missing_libraries.insert(artifact.path);
                }
            }
        }

        // Diff every asset object of the index.
        if let Some(index) = &asset_index {
            for (name, object) in &index.objects {
                let file = layout::asset_object_file(&self.config.assets_dir, &object.hash);
                if !file_exists(&file).await? {
                    missing_assets.insert(name.clone());
                }
            }
        }

        {
            let mut docs = self.docs.lock().unwrap();
            docs.descriptor = descriptor;
            docs.asset_index = asset_index;
        }

        self.with_state(|state| {
            state.initialized = true;
            state.missing_files = missing_files;
            state.missing_libraries = missing_libraries;
            state.missing_assets = missing_assets;
            state.last_error = None;
        });

        Ok(())

    }

    /// Start a download session for everything currently missing and return its
    /// live [`DownloadState`] immediately; the work runs on the runtime's workers.
    /// The handler observes the session synchronously from those workers.
    ///
    /// Per-artifact failures in the parallel phases only advance the failed
    /// counter, the session still completes; the re-`init` that follows a
    /// completed session leaves genuinely missing files in the missing sets,
    /// keeping the installation un-launchable rather than raising.
    pub async fn download(self: &Arc<Self>, handler: impl Handler) -> Result<Arc<DownloadState>> {

        if !self.state.lock().unwrap().initialized {
            return Err(Error::PreconditionNotMet { reason: "init before download" });
        }

        let dl = Arc::new(DownloadState::new());

        let task = tokio::spawn(run_session(
            Arc::clone(self),
            Arc::clone(&dl),
            handler));

        *dl.task.lock().unwrap() = Some(task);

        Ok(dl)

    }

    /// Spawn the game process: working directory set to the main directory,
    /// stdout/stderr inherited. Requires `can_launch`.
    pub async fn run(&self) -> Result<Child> {
        let command = self.launch_command()?;
        command.spawn().map_err(Error::new_io)
    }

    /// Build the deterministic launch command for the configured version.
    /// Requires `can_launch`.
    pub fn launch_command(&self) -> Result<LaunchCommand> {

        if !self.state.lock().unwrap().can_launch {
            return Err(Error::PreconditionNotMet { reason: "installation is not ready to launch" });
        }

        let docs = self.docs.lock().unwrap();
        let descriptor = docs.descriptor.as_ref()
            .ok_or(Error::PreconditionNotMet { reason: "no version descriptor loaded" })?;

        Ok(LaunchCommand::new(&self.config, descriptor))

    }

    /// Release engine resources. The engine owns no detached resources (sessions
    /// are awaited or cancelled through their [`DownloadState`] and the HTTP
    /// client is process-wide), so this is an idempotent no-op kept for API
    /// parity.
    pub fn close(&self) { }

}

/// A resolved library artifact to diff and possibly download.
#[derive(Debug)]
struct LibArtifact {
    /// Maven-style relative path of the artifact.
    path: String,
    /// Download URL, when absolute it is used as-is, otherwise the default
    /// libraries endpoint is derived with the path.
    url: Option<String>,
}

/// Collect the artifacts of every admitted library of a descriptor: the main
/// artifact and, when a native classifier applies to the host, the native one.
/// Artifacts without a maven path cannot be located and are skipped with a
/// warning.
fn library_artifacts(descriptor: &serde::VersionDescriptor) -> Vec<LibArtifact> {

    let mut artifacts = Vec::new();

    for library in &descriptor.libraries {

        if !rules::is_admitted(library) {
            continue;
        }

        let mut push = |artifact: &serde::Artifact| {
            match &artifact.path {
                Some(path) => artifacts.push(LibArtifact {
                    path: path.clone(),
                    url: artifact.url.clone(),
                }),
                None => log::warn!("library {} has an artifact without path, ignoring", library.name),
            }
        };

        if let Some(artifact) = &library.downloads.artifact {
            push(artifact);
        }

        if let Some(classifier) = rules::natives_classifier(library) {
            match library.downloads.classifiers.get(classifier) {
                Some(artifact) => push(artifact),
                None => log::warn!("library {} declares natives but no {classifier} classifier", library.name),
            }
        }

    }

    artifacts

}

/// True if the URL can be used as-is for a library artifact.
fn is_absolute_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Read and parse a JSON document from disk, none if the file does not exist.
async fn read_json_file<T: for<'de> ::serde::Deserialize<'de>>(file: &Path) -> Result<Option<T>> {

    let content = match tokio::fs::read_to_string(file).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::new_io_file(e, file)),
    };

    let mut deserializer = serde_json::Deserializer::from_str(&content);
    serde_path_to_error::deserialize::<_, T>(&mut deserializer)
        .map(Some)
        .map_err(|e| Error::new_json_file(e, file))

}

/// Check file existence, distinguishing a missing file from an IO failure.
async fn file_exists(file: &Path) -> Result<bool> {
    match tokio::fs::metadata(file).await {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::new_io_file(e, file)),
    }
}


// ========================= //
//     DOWNLOAD SESSION      //
// ========================= //

/// Entrypoint of the session task spawned by [`Engine::download`].
async fn run_session(engine: Arc<Engine>, dl: Arc<DownloadState>, mut handler: impl Handler) {

    if dl.try_set_status(DownloadStatus::Downloading) {
        handler.status_change(DownloadStatus::Downloading);
    }

    match run_session_inner(&engine, &dl, &mut handler).await {
        Ok(()) => {

            // Re-diff against disk before reporting completion, making the disk
            // the source of truth: files that failed to download stay missing and
            // keep the launch blocked. The session is completed even with failed
            // files.
            if let Err(e) = engine.init().await {
                log::warn!("re-initialization after download failed: {e}");
            }

            if dl.try_set_status(DownloadStatus::Completed) {
                handler.status_change(DownloadStatus::Completed);
            }

        }
        Err(e) => {

            handler.error(&e);

            engine.with_state(|state| {
                state.last_error = Some(e.to_string());
            });

            if dl.try_set_status(DownloadStatus::Failed) {
                handler.status_change(DownloadStatus::Failed);
            }

        }
    }

}

async fn run_session_inner(
    engine: &Arc<Engine>,
    dl: &Arc<DownloadState>,
    handler: &mut impl Handler,
) -> Result<()> {

    let config = &engine.config;

    // Snapshot the missing sentinels, the closing re-init reconciles the rest
    // with the disk. The initial total only counts what the init diff could see,
    // it grows as freshly fetched documents reveal missing libraries and assets.
    let missing_files = {
        let state = engine.state.lock().unwrap();
        let total = state.total_missing() as u32;
        dl.total_files.store(total, Ordering::Relaxed);
        state.missing_files.clone()
    };

    handler.progress(0, 0, dl.total_files(), "");

    // Phases are strictly sequential up to the client JAR because each one
    // depends on the previous document being in memory.

    if missing_files.contains(&MissingFile::VersionJson) {

        dl.set_current_file(MissingFile::VersionJson.as_str());

        let manifest = catalog::fetch_manifest_at(&config.manifest_url).await?;
        let entry = manifest.versions.iter()
            .find(|entry| entry.id == config.version_id)
            .ok_or_else(|| Error::VersionNotFound { id: config.version_id.clone() })?;

        download::single(entry.url.clone(), config.version_json_path.clone())
            .download(()).await?;

        let descriptor = read_json_file::<serde::VersionDescriptor>(&config.version_json_path).await?
            .ok_or_else(|| Error::new_io_file(io::ErrorKind::NotFound.into(), &config.version_json_path))?;

        // The init diff could not see the libraries without a descriptor, diff
        // them now and grow the session accordingly.
        let mut new_missing = IndexSet::new();
        for artifact in library_artifacts(&descriptor) {
            let file = layout::library_file(&config.libraries_dir, &artifact.path);
            if !file_exists(&file).await? {
                new_missing.insert(artifact.path);
            }
        }

        engine.docs.lock().unwrap().descriptor = Some(descriptor);

        engine.with_state(|state| {
            state.missing_files.shift_remove(&MissingFile::VersionJson);
            state.missing_libraries.extend(new_missing.iter().cloned());
        });

        dl.total_files.fetch_add(new_missing.len() as u32, Ordering::Relaxed);
        complete_one(dl, handler, false);

    }

    let descriptor = engine.docs.lock().unwrap().descriptor.clone();

    if missing_files.contains(&MissingFile::AssetIndex) {
        if let Some(descriptor) = &descriptor {

            dl.set_current_file(MissingFile::AssetIndex.as_str());

            let url = descriptor.asset_index.download.url.as_deref()
                .ok_or(Error::InvalidDescriptor { what: "asset index url" })?;

            let index_file = layout::asset_index_file(&config.assets_dir, &descriptor.asset_index.id);

            download::single(url, index_file.clone())
                .download(()).await?;

            let index = read_json_file::<serde::AssetIndex>(&index_file).await?
                .ok_or_else(|| Error::new_io_file(io::ErrorKind::NotFound.into(), &index_file))?;

            // Likewise, the freshly fetched index reveals the missing assets.
            let mut new_missing = IndexSet::new();
            for (name, object) in &index.objects {
                let file = layout::asset_object_file(&config.assets_dir, &object.hash);
                if !file_exists(&file).await? {
                    new_missing.insert(name.clone());
                }
            }

            engine.docs.lock().unwrap().asset_index = Some(index);

            engine.with_state(|state| {
                state.missing_files.shift_remove(&MissingFile::AssetIndex);
                state.missing_assets.extend(new_missing.iter().cloned());
            });

            dl.total_files.fetch_add(new_missing.len() as u32, Ordering::Relaxed);
            complete_one(dl, handler, false);

        }
    }

    if missing_files.contains(&MissingFile::ClientJar) {
        if let Some(descriptor) = &descriptor {

            dl.set_current_file(MissingFile::ClientJar.as_str());

            let client = descriptor.downloads.get("client")
                .ok_or(Error::InvalidDescriptor { what: "client download" })?;
            let url = client.url.as_deref()
                .ok_or(Error::InvalidDescriptor { what: "client url" })?;

            download::single(url, config.version_jar_path.clone())
                .download(()).await?;

            engine.with_state(|state| {
                state.missing_files.shift_remove(&MissingFile::ClientJar);
            });

            complete_one(dl, handler, false);

        }
    }

    if dl.is_cancelled() {
        return Ok(());
    }

    // The parallel phases: missing libraries and assets go into a single batch
    // and interleave on the worker pool. Per-entry failures are only counted.

    let (missing_libraries, missing_assets) = {
        let state = engine.state.lock().unwrap();
        (state.missing_libraries.clone(), state.missing_assets.clone())
    };

    let mut batch = Batch::new();
    let mut items = HashMap::new();

    if let Some(descriptor) = &descriptor {
        for artifact in library_artifacts(descriptor) {

            if !missing_libraries.contains(&artifact.path) {
                continue;
            }

            let url = match artifact.url.as_deref().filter(|url| is_absolute_url(url)) {
                Some(url) => url.to_string(),
                None => format!("{}{}", config.libraries_url, artifact.path),
            };

            let file = layout::library_file(&config.libraries_dir, &artifact.path);
            items.insert(file.clone(), WorkItem::Library(artifact.path.clone()));
            batch.push(url, file);

        }
    }

    let asset_index = engine.docs.lock().unwrap().asset_index.clone();
    if let Some(index) = &asset_index {
        for (name, object) in &index.objects {

            if !missing_assets.contains(name) {
                continue;
            }

            let hash = &object.hash;
            let url = format!("{}{}/{hash}", config.resources_url, &hash[..2]);

            let file = layout::asset_object_file(&config.assets_dir, hash);
            items.insert(file.clone(), WorkItem::Asset(name.clone()));
            batch.push(url, file);

        }
    }

    if !batch.is_empty() {

        let bridge = SessionBridge {
            engine,
            dl,
            handler,
            items: &items,
        };

        batch.download(bridge).await?;

    }

    Ok(())

}

/// What a batched download entry stands for, keyed by its target file.
#[derive(Debug)]
enum WorkItem {
    Library(String),
    Asset(String),
}

impl WorkItem {

    fn name(&self) -> &str {
        match self {
            WorkItem::Library(path) => path,
            WorkItem::Asset(name) => name,
        }
    }

}

/// Bridge from the batch downloader progress to the session state and the
/// session observer.
struct SessionBridge<'a, H> {
    engine: &'a Arc<Engine>,
    dl: &'a Arc<DownloadState>,
    handler: &'a mut H,
    items: &'a HashMap<PathBuf, WorkItem>,
}

impl<H: Handler> download::Handler for SessionBridge<'_, H> {

    fn complete(&mut self, entry: &Entry, error: Option<&EntryErrorKind>) {

        let Some(item) = self.items.get(entry.file()) else {
            return;
        };

        self.dl.set_current_file(item.name());

        match error {
            None => {
                self.engine.with_state(|state| {
                    match item {
                        WorkItem::Library(path) => state.missing_libraries.shift_remove(path),
                        WorkItem::Asset(name) => state.missing_assets.shift_remove(name),
                    }
                });
                complete_one(self.dl, &mut *self.handler, false);
            }
            Some(e) => {
                log::warn!("failed to download {}: {e}", entry.url());
                complete_one(self.dl, &mut *self.handler, true);
            }
        }

    }

}

/// Advance the session counters by one finished file and notify the observer.
fn complete_one(dl: &DownloadState, handler: &mut impl Handler, failed: bool) {

    if failed {
        dl.failed_files.fetch_add(1, Ordering::Relaxed);
    } else {
        dl.completed_files.fetch_add(1, Ordering::Relaxed);
    }

    handler.progress(
        dl.completed_files(),
        dl.failed_files(),
        dl.total_files(),
        &dl.current_file());

}


// ========================= //
//      LAUNCH COMMAND       //
// ========================= //

/// The materialized invocation of the game process: program, deterministic argv
/// and working directory. The argv can be inspected before spawning.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    program: String,
    args: Vec<OsString>,
    mc_dir: PathBuf,
}

impl LaunchCommand {

    fn new(config: &LaunchConfig, descriptor: &serde::VersionDescriptor) -> Self {

        let mut args = Vec::new();

        // Memory flags first.
        args.push(format!("-Xmx{}m", config.max_memory_mb).into());
        args.push(format!("-Xms{}m", config.min_memory_mb).into());

        // Custom JVM arguments in insertion order.
        for (flag, value) in &config.jvm_args {
            args.push(flag.clone().into());
            if !value.is_empty() {
                args.push(value.clone().into());
            }
        }

        // The class path: client JAR first, then every admitted library with a
        // main artifact in descriptor order. Native-only entries are excluded.
        let mut class_files = vec![config.version_jar_path.clone()];
        for library in &descriptor.libraries {
            if !rules::is_admitted(library) {
                continue;
            }
            if let Some(artifact) = &library.downloads.artifact {
                if let Some(path) = &artifact.path {
                    class_files.push(layout::library_file(&config.libraries_dir, path));
                }
            }
        }

        args.push("-cp".into());
        args.push(env::join_paths(class_files).unwrap());

        args.push(descriptor.main_class.clone().into());

        // Standard game arguments with the synthetic offline identity, a fresh
        // UUID per launch.
        let game_args = [
            ("--username", config.username.clone()),
            ("--version", config.version_id.clone()),
            ("--gameDir", config.mc_dir.display().to_string()),
            ("--assetsDir", config.assets_dir.display().to_string()),
            ("--assetIndex", descriptor.asset_index.id.clone()),
            ("--uuid", Uuid::new_v4().to_string()),
            ("--accessToken", OFFLINE_ACCESS_TOKEN.to_string()),
            ("--userType", "mojang".to_string()),
            ("--versionType", descriptor.r#type.clone()),
        ];

        for (flag, value) in game_args {
            args.push(flag.into());
            args.push(value.into());
        }

        // Custom game arguments in insertion order.
        for (flag, value) in &config.game_args {
            args.push(flag.clone().into());
            if !value.is_empty() {
                args.push(value.clone().into());
            }
        }

        Self {
            program: "java".to_string(),
            args,
            mc_dir: config.mc_dir.clone(),
        }

    }

    #[inline]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[inline]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Create the process command: stdout and stderr are left inherited so the
    /// game logs flow to the parent's.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .current_dir(&self.mc_dir)
            .args(&self.args);
        command
    }

    /// Spawn the game process and return its handle.
    pub fn spawn(&self) -> io::Result<Child> {
        self.command().spawn()
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    fn test_descriptor() -> serde::VersionDescriptor {
        serde_json::from_value(serde_json::json!({
            "id": "1.20.1",
            "type": "release",
            "releaseTime": "2023-06-12T13:25:51+00:00",
            "mainClass": "net.minecraft.client.main.Main",
            "assetIndex": {
                "id": "5",
                "url": "https://example.com/indexes/5.json",
            },
            "downloads": {
                "client": {
                    "url": "https://example.com/client.jar",
                },
            },
            "libraries": [
                {
                    "name": "com.example:alpha:1.0",
                    "downloads": {
                        "artifact": {
                            "path": "com/example/alpha/1.0/alpha-1.0.jar",
                        },
                    },
                },
                {
                    "name": "com.example:never:1.0",
                    "rules": [{"action": "allow", "os": {"name": "plan9"}}],
                    "downloads": {
                        "artifact": {
                            "path": "com/example/never/1.0/never-1.0.jar",
                        },
                    },
                },
            ],
        })).unwrap()
    }

    fn test_config() -> LaunchConfig {
        let mut config = LaunchConfig::new("Steve", "1.20.1", "/mc");
        config.add_jvm_arg("-XX:+UseG1GC", "");
        config.add_game_arg("--demo", "");
        config
    }

    fn arg_strings(command: &LaunchCommand) -> Vec<String> {
        command.args().iter().map(|arg| arg.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn empty_username_is_rejected() {
        let config = LaunchConfig::new("", "1.20.1", "/mc");
        assert!(matches!(Engine::new(config), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn version_paths_resolve_under_versions_dir() {
        let config = test_config();
        assert_eq!(config.version_json_path(), Path::new("/mc/versions/1.20.1/1.20.1.json"));
        assert_eq!(config.version_jar_path(), Path::new("/mc/versions/1.20.1/1.20.1.jar"));
    }

    #[tokio::test]
    async fn download_before_init_is_rejected() {
        let engine = Arc::new(Engine::new(test_config()).unwrap());
        let res = engine.download(()).await;
        assert!(matches!(res, Err(Error::PreconditionNotMet { .. })));
    }

    #[test]
    fn launch_command_is_deterministic() {

        let config = test_config();
        let command = LaunchCommand::new(&config, &test_descriptor());
        let args = arg_strings(&command);

        assert_eq!(command.program(), "java");
        assert_eq!(args[0], "-Xmx2048m");
        assert_eq!(args[1], "-Xms512m");
        assert_eq!(args[2], "-XX:+UseG1GC");

        // Exactly one -cp flag, the client JAR first on the class path, admitted
        // libraries after it, rejected ones absent.
        assert_eq!(args.iter().filter(|arg| *arg == "-cp").count(), 1);
        let cp_index = args.iter().position(|arg| arg == "-cp").unwrap();
        let class_path = &args[cp_index + 1];
        let entries = std::env::split_paths(class_path).collect::<Vec<_>>();
        assert_eq!(entries[0], Path::new("/mc/versions/1.20.1/1.20.1.jar"));
        assert!(entries.iter().any(|entry| entry.ends_with("alpha-1.0.jar")));
        assert!(!entries.iter().any(|entry| entry.ends_with("never-1.0.jar")));

        assert_eq!(args[cp_index + 2], "net.minecraft.client.main.Main");

        // The offline identity contract.
        let token_index = args.iter().position(|arg| arg == "--accessToken").unwrap();
        assert_eq!(args[token_index + 1], "0");
        let type_index = args.iter().position(|arg| arg == "--userType").unwrap();
        assert_eq!(args[type_index + 1], "mojang");

        // Custom game args last.
        assert_eq!(args.last().unwrap(), "--demo");

    }

    #[test]
    fn launch_uuid_is_fresh_per_command() {

        let config = test_config();
        let descriptor = test_descriptor();

        let find_uuid = |command: &LaunchCommand| {
            let args = arg_strings(command);
            let index = args.iter().position(|arg| arg == "--uuid").unwrap();
            args[index + 1].clone()
        };

        let first = find_uuid(&LaunchCommand::new(&config, &descriptor));
        let second = find_uuid(&LaunchCommand::new(&config, &descriptor));
        assert_ne!(first, second);

    }

    #[test]
    fn missing_sets_are_idempotent() {

        let mut state = LaunchState::default();
        assert!(state.missing_files.insert(MissingFile::ClientJar));
        assert!(!state.missing_files.insert(MissingFile::ClientJar));
        assert_eq!(state.missing_files.len(), 1);

        assert!(state.missing_libraries.insert("a/b/c.jar".to_string()));
        assert!(!state.missing_libraries.insert("a/b/c.jar".to_string()));
        assert!(!state.missing_libraries.shift_remove("not-there"));
        assert_eq!(state.total_missing(), 2);

        state.initialized = true;
        state.update_can_launch();
        assert!(!state.can_launch);
        assert!(state.needs_download());

        state.missing_files.clear();
        state.missing_libraries.clear();
        state.update_can_launch();
        assert!(state.can_launch);
        assert!(!state.needs_download());

    }

}
