use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::io::Write as _;
use std::fs;

use mcboot::engine::{DownloadStatus, Engine, Error, Handler, LaunchConfig, MissingFile};
use mcboot::{layout, rules};

use tempfile::TempDir;

use mockito::{Server, ServerGuard};


const VERSION: &str = "1.20.1";

const ALPHA_PATH: &str = "com/example/alpha/1.0/alpha-1.0.jar";
const BETA_PATH: &str = "com/example/beta/1.0/beta-1.0.jar";
const GAMMA_PATH: &str = "com/example/gamma/1.0/gamma-1.0.jar";
const NEVER_PATH: &str = "com/example/never/1.0/never-1.0.jar";

const ICON_NAME: &str = "icons/icon_16x16.png";
const ICON_HASH: &str = "bdf48ef6b5d0d23bbb02e17d04865216179f510a";
const SOUND_NAME: &str = "minecraft/sounds/random/click.ogg";
const SOUND_HASH: &str = "f04f7f9f3e2e18b7b8c5f7b0dbe16dcaa24a75e0";


/// A scratch installation backed by a local mock of the distribution endpoints.
struct TestInstall {
    server: ServerGuard,
    dir: TempDir,
}

impl TestInstall {

    async fn new() -> Self {

        let mut server = Server::new_async().await;
        let url = server.url();

        server.mock("GET", "/manifest.json")
            .with_status(200)
            .with_body(serde_json::json!({
                "latest": {
                    "release": VERSION,
                    "snapshot": VERSION,
                },
                "versions": [
                    {
                        "id": VERSION,
                        "type": "release",
                        "url": format!("{url}/v1/{VERSION}.json"),
                        "releaseTime": "2023-06-12T13:25:51+00:00",
                        "sha1": "715ccf3330885e75b205124f09f8712542cbe7e0",
                    },
                ],
            }).to_string())
            .create_async().await;

        server.mock("GET", &*format!("/v1/{VERSION}.json"))
            .with_status(200)
            .with_body(Self::descriptor_json(&url))
            .create_async().await;

        server.mock("GET", "/client.jar")
            .with_status(200)
            .with_body("client-jar-bytes")
            .create_async().await;

        server.mock("GET", "/indexes/5.json")
            .with_status(200)
            .with_body(serde_json::json!({
                "objects": {
                    ICON_NAME: { "hash": ICON_HASH, "size": 4 },
                    SOUND_NAME: { "hash": SOUND_HASH, "size": 5 },
                },
            }).to_string())
            .create_async().await;

        server.mock("GET", &*format!("/resources/{}/{ICON_HASH}", &ICON_HASH[..2]))
            .with_status(200)
            .with_body("icon")
            .create_async().await;

        server.mock("GET", &*format!("/resources/{}/{SOUND_HASH}", &SOUND_HASH[..2]))
            .with_status(200)
            .with_body("click")
            .create_async().await;

        // Alpha is served from its absolute artifact URL, the others from the
        // default libraries endpoint.
        server.mock("GET", "/alpha-download.jar")
            .with_status(200)
            .with_body("alpha")
            .create_async().await;

        server.mock("GET", &*format!("/libraries/{BETA_PATH}"))
            .with_status(200)
            .with_body("beta")
            .create_async().await;

        server.mock("GET", &*format!("/libraries/{GAMMA_PATH}"))
            .with_status(200)
            .with_body("gamma")
            .create_async().await;

        Self {
            server,
            dir: tempfile::Builder::new()
                .prefix("")
                .suffix(".install")
                .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
                .unwrap(),
        }

    }

    fn descriptor_json(url: &str) -> String {
        serde_json::json!({
            "id": VERSION,
            "type": "release",
            "releaseTime": "2023-06-12T13:25:51+00:00",
            "mainClass": "net.minecraft.client.main.Main",
            "assetIndex": {
                "id": "5",
                "url": format!("{url}/indexes/5.json"),
                "sha1": "2d4e26cee95c98c9cb3771e0a1ab1a02f1a2aeeb",
                "size": 148,
            },
            "downloads": {
                "client": {
                    "url": format!("{url}/client.jar"),
                    "sha1": "30c73b1c5da787909b2f73340419fdf13b9def88",
                    "size": 16,
                },
            },
            "libraries": [
                {
                    "name": "com.example:alpha:1.0",
                    "downloads": {
                        "artifact": {
                            "path": ALPHA_PATH,
                            "url": format!("{url}/alpha-download.jar"),
                            "size": 5,
                        },
                    },
                },
                {
                    // No artifact URL, resolved against the default endpoint.
                    "name": "com.example:beta:1.0",
                    "downloads": {
                        "artifact": {
                            "path": BETA_PATH,
                        },
                    },
                },
                {
                    // The classic pair rejecting the library on macOS only.
                    "name": "com.example:gamma:1.0",
                    "rules": [
                        { "action": "allow" },
                        { "action": "disallow", "os": { "name": "osx" } },
                    ],
                    "downloads": {
                        "artifact": {
                            "path": GAMMA_PATH,
                        },
                    },
                },
                {
                    // Never admitted on any host we run tests on.
                    "name": "com.example:never:1.0",
                    "rules": [
                        { "action": "allow", "os": { "name": "plan9" } },
                    ],
                    "downloads": {
                        "artifact": {
                            "path": NEVER_PATH,
                        },
                    },
                },
            ],
        }).to_string()
    }

    fn config(&self, version: &str) -> LaunchConfig {
        let url = self.server.url();
        let mut config = LaunchConfig::new("Steve", version, self.dir.path());
        config.set_manifest_url(format!("{url}/manifest.json"));
        config.set_libraries_url(format!("{url}/libraries/"));
        config.set_resources_url(format!("{url}/resources/"));
        config
    }

    /// True if the macOS-rejected library applies to the host running the tests.
    fn gamma_admitted() -> bool {
        rules::os_name() != Some("osx")
    }

    fn expected_library_count() -> u32 {
        if Self::gamma_admitted() { 3 } else { 2 }
    }

    async fn install(&self) -> Arc<Engine> {
        let engine = Arc::new(Engine::new(self.config(VERSION)).unwrap());
        engine.init().await.unwrap();
        let dl = engine.download(()).await.unwrap();
        assert_eq!(dl.wait().await, DownloadStatus::Completed);
        assert_eq!(dl.failed_files(), 0);
        engine
    }

}


#[tokio::test]
async fn cold_install() {

    let install = TestInstall::new().await;
    let engine = Arc::new(Engine::new(install.config(VERSION)).unwrap());

    engine.init().await.unwrap();

    let state = engine.state();
    assert!(state.initialized());
    assert!(!state.can_launch());
    assert!(state.needs_download());
    assert_eq!(state.missing_files().len(), 3);
    assert!(state.missing_files().contains(&MissingFile::VersionJson));
    assert!(state.missing_files().contains(&MissingFile::AssetIndex));
    assert!(state.missing_files().contains(&MissingFile::ClientJar));
    // Nothing else can be known before the descriptor and index are fetched.
    assert!(state.missing_libraries().is_empty());
    assert!(state.missing_assets().is_empty());

    let dl = engine.download(()).await.unwrap();
    assert_eq!(dl.wait().await, DownloadStatus::Completed);

    // Three sentinels plus N libraries plus M assets.
    let expected_total = 3 + TestInstall::expected_library_count() + 2;
    assert_eq!(dl.total_files(), expected_total);
    assert_eq!(dl.completed_files(), expected_total);
    assert_eq!(dl.failed_files(), 0);

    // The re-diff that closed the session leaves a launchable installation.
    let state = engine.state();
    assert!(state.can_launch());
    assert_eq!(state.total_missing(), 0);

    // Everything is on disk where the layout says it should be.
    let mc_dir = install.dir.path();
    assert!(layout::version_json_file(mc_dir, VERSION).is_file());
    assert_eq!(fs::read_to_string(layout::version_jar_file(mc_dir, VERSION)).unwrap(), "client-jar-bytes");
    assert!(layout::asset_index_file(&mc_dir.join("assets"), "5").is_file());
    assert_eq!(fs::read_to_string(layout::asset_object_file(&mc_dir.join("assets"), ICON_HASH)).unwrap(), "icon");
    assert_eq!(fs::read_to_string(layout::asset_object_file(&mc_dir.join("assets"), SOUND_HASH)).unwrap(), "click");
    assert!(mc_dir.join("libraries").join(ALPHA_PATH).is_file());
    assert!(mc_dir.join("libraries").join(BETA_PATH).is_file());
    assert_eq!(mc_dir.join("libraries").join(GAMMA_PATH).is_file(), TestInstall::gamma_admitted());
    assert!(!mc_dir.join("libraries").join(NEVER_PATH).exists());

}

#[tokio::test]
async fn warm_cache() {

    let install = TestInstall::new().await;
    install.install().await;

    // A fresh engine over the same directory is immediately launchable.
    let engine = Engine::new(install.config(VERSION)).unwrap();
    engine.init().await.unwrap();

    let state = engine.state();
    assert!(state.can_launch());
    assert!(!state.needs_download());
    assert_eq!(state.total_missing(), 0);

    // Round-trip: the descriptor written by the download session parses back
    // into the same launch-relevant fields.
    let command = engine.launch_command().unwrap();
    let args = command.args().iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert!(args.contains(&"net.minecraft.client.main.Main".to_string()));
    let index = args.iter().position(|arg| arg == "--assetIndex").unwrap();
    assert_eq!(args[index + 1], "5");
    let index = args.iter().position(|arg| arg == "--versionType").unwrap();
    assert_eq!(args[index + 1], "release");

}

#[tokio::test]
async fn partial_corruption() {

    let install = TestInstall::new().await;
    install.install().await;

    // Remove one library file behind the engine's back.
    let beta_file = install.dir.path().join("libraries").join(BETA_PATH);
    fs::remove_file(&beta_file).unwrap();

    let engine = Arc::new(Engine::new(install.config(VERSION)).unwrap());
    engine.init().await.unwrap();

    let state = engine.state();
    assert!(!state.can_launch());
    assert!(state.missing_files().is_empty());
    assert!(state.missing_assets().is_empty());
    assert_eq!(state.missing_libraries().len(), 1);
    assert!(state.missing_libraries().contains(BETA_PATH));

    let dl = engine.download(()).await.unwrap();
    assert_eq!(dl.wait().await, DownloadStatus::Completed);
    assert_eq!(dl.total_files(), 1);
    assert_eq!(dl.completed_files(), 1);

    assert_eq!(fs::read_to_string(&beta_file).unwrap(), "beta");
    assert!(engine.state().can_launch());

}

#[tokio::test]
async fn version_not_found() {

    #[derive(Clone, Default)]
    struct Collect {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Collect {

        fn status_change(&mut self, status: DownloadStatus) {
            self.events.lock().unwrap().push(format!("status:{status:?}"));
        }

        fn error(&mut self, error: &Error) {
            self.events.lock().unwrap().push(format!("error:{error}"));
        }

    }

    let install = TestInstall::new().await;
    let engine = Arc::new(Engine::new(install.config("9.9.9")).unwrap());

    engine.init().await.unwrap();

    let collect = Collect::default();
    let dl = engine.download(collect.clone()).await.unwrap();
    assert_eq!(dl.wait().await, DownloadStatus::Failed);

    let state = engine.state();
    assert!(state.last_error().unwrap().contains("9.9.9"));

    let events = collect.events.lock().unwrap();
    assert_eq!(events[0], "status:Downloading");
    assert!(events[1].starts_with("error:version not found"));
    assert_eq!(events[2], "status:Failed");

}

#[tokio::test]
async fn offline_with_local_install() {

    let install = TestInstall::new().await;
    install.install().await;

    // Point every endpoint at an unreachable address, a complete local
    // installation must initialize and build its launch command regardless.
    let mut config = install.config(VERSION);
    config.set_manifest_url("http://127.0.0.1:9/manifest.json");
    config.set_libraries_url("http://127.0.0.1:9/libraries/");
    config.set_resources_url("http://127.0.0.1:9/resources/");

    let engine = Engine::new(config).unwrap();
    engine.init().await.unwrap();
    assert!(engine.state().can_launch());

    let command = engine.launch_command().unwrap();
    assert_eq!(command.program(), "java");
    let args = command.args().iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    let index = args.iter().position(|arg| arg == "--version").unwrap();
    assert_eq!(args[index + 1], VERSION);
    let index = args.iter().position(|arg| arg == "--accessToken").unwrap();
    assert_eq!(args[index + 1], "0");

}

#[tokio::test]
async fn per_artifact_failure_blocks_launch() {

    let install = TestInstall::new().await;
    install.install().await;

    // Corrupt the installation with a library whose endpoint now rejects it: the
    // session still completes but the re-diff keeps the launch blocked.
    let alpha_file = install.dir.path().join("libraries").join(ALPHA_PATH);
    fs::remove_file(&alpha_file).unwrap();

    let mut server = Server::new_async().await;
    server.mock("GET", "/alpha-download.jar")
        .with_status(500)
        .create_async().await;

    // Rewrite the local descriptor so alpha points at the failing server.
    let descriptor_file = layout::version_json_file(install.dir.path(), VERSION);
    let descriptor = fs::read_to_string(&descriptor_file).unwrap()
        .replace(&format!("{}/alpha-download.jar", install.server.url()),
                 &format!("{}/alpha-download.jar", server.url()));
    fs::write(&descriptor_file, descriptor).unwrap();

    let engine = Arc::new(Engine::new(install.config(VERSION)).unwrap());
    engine.init().await.unwrap();
    assert_eq!(engine.state().missing_libraries().len(), 1);

    let dl = engine.download(()).await.unwrap();
    assert_eq!(dl.wait().await, DownloadStatus::Completed);
    assert_eq!(dl.total_files(), 1);
    assert_eq!(dl.completed_files(), 0);
    assert_eq!(dl.failed_files(), 1);

    let state = engine.state();
    assert!(!state.can_launch());
    assert!(state.missing_libraries().contains(ALPHA_PATH));

}

#[tokio::test]
async fn cancellation() {

    let install = TestInstall::new().await;

    // A server that stalls long enough for the cancel to always win the race.
    let mut slow_server = Server::new_async().await;
    slow_server.mock("GET", "/manifest.json")
        .with_chunked_body(|writer| {
            std::thread::sleep(Duration::from_secs(5));
            writer.write_all(b"{}")
        })
        .create_async().await;

    let mut config = install.config(VERSION);
    config.set_manifest_url(format!("{}/manifest.json", slow_server.url()));

    let engine = Arc::new(Engine::new(config).unwrap());
    engine.init().await.unwrap();

    let dl = engine.download(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    dl.cancel();

    assert_eq!(dl.wait().await, DownloadStatus::Cancelled);

    // A later init re-establishes the truth against disk.
    engine.init().await.unwrap();
    assert!(engine.state().needs_download());

}
