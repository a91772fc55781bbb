//! End-to-end lifecycle tests
//!
//! Packages are sealed with a real key, stored, verified, resolved and run
//! through both entry point strategies.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use palisade_core::audit::{AuditEventKind, MemoryAuditSink};
use palisade_core::config::Config;
use palisade_core::signing::{PluginSigner, TrustedKeys};
use palisade_plugins::isolation::{
    BridgeCall, BridgeValue, BusMessage, EgressError, GuestContext, NativeEntryFactory,
    NetworkEgress, PluginEntry,
};
use palisade_plugins::manifest::Dependency;
use palisade_plugins::store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use palisade_plugins::{
    EntryPoint, LifecycleManager, Permission, PluginError, PluginMetadata, PluginPackage,
    PluginState, ResolutionError, ResourceKind,
};
use semver::Version;
use serde_json::{Value, json};
use tempfile::TempDir;
use url::Url;

const MB: u64 = 1024 * 1024;

const ADD_ONE: &str = r#"
    (module
      (func (export "handle") (param i32) (result i32)
        local.get 0
        i32.const 1
        i32.add))
"#;

/// Native plugin used throughout: each command exercises one bridge
#[derive(Default)]
struct Agent {
    inbox: Vec<Value>,
}

#[async_trait]
impl PluginEntry for Agent {
    async fn handle(
        &mut self,
        ctx: &GuestContext,
        command: &str,
        args: Value,
    ) -> Result<Value, String> {
        let text = |key: &str| args[key].as_str().unwrap_or_default().to_string();
        match command {
            "echo" => Ok(args),
            "write" => {
                ctx.write_file(&text("path"), text("text").into_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            "read" => {
                let bytes = ctx.read_file(&text("path")).await.map_err(|e| e.to_string())?;
                Ok(json!(String::from_utf8_lossy(&bytes)))
            }
            "fetch" => {
                let call = BridgeCall::NetworkSend {
                    url: text("url"),
                    body: b"ping".to_vec(),
                };
                match ctx.call(call).await.map_err(|e| e.to_string())? {
                    BridgeValue::Bytes(body) => {
                        Ok(json!(String::from_utf8_lossy(&body)))
                    }
                    other => Err(format!("unexpected {other:?}")),
                }
            }
            "subscribe" => {
                ctx.subscribe(&text("topic")).await.map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            "publish" => {
                let delivered = ctx
                    .publish(&text("topic"), args["payload"].clone())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(delivered))
            }
            "inbox" => Ok(Value::Array(self.inbox.clone())),
            other => Err(format!("unknown command {other}")),
        }
    }

    async fn on_message(&mut self, _ctx: &GuestContext, message: BusMessage) {
        self.inbox.push(json!({ "from": message.from, "payload": message.payload }));
    }
}

#[derive(Debug, Default)]
struct RecordingEgress {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl NetworkEgress for RecordingEgress {
    async fn send(
        &self,
        url: &Url,
        _body: Vec<u8>,
        _max_response: u64,
    ) -> Result<Vec<u8>, EgressError> {
        self.sent.lock().unwrap().push(url.to_string());
        Ok(b"pong".to_vec())
    }
}

struct Host {
    manager: LifecycleManager,
    signer: PluginSigner,
    audit: MemoryAuditSink,
    egress: Arc<RecordingEgress>,
    _files: TempDir,
}

fn trusted(signer: &PluginSigner) -> TrustedKeys {
    let mut keys = TrustedKeys::new();
    keys.add_bytes(&signer.verifying_key_bytes()).unwrap();
    keys
}

fn start(store: Arc<dyn ArtifactStore>, signer: PluginSigner, config: Config) -> Host {
    let audit = MemoryAuditSink::new();
    let egress = Arc::new(RecordingEgress::default());
    let files = TempDir::new().unwrap();
    let manager = LifecycleManager::builder()
        .config(config)
        .store(store)
        .trusted_keys(trusted(&signer))
        .native_entries(
            NativeEntryFactory::new().register("agent", |_, _| Ok(Box::new(Agent::default()))),
        )
        .audit_sink(Arc::new(audit.clone()))
        .network_egress(egress.clone())
        .files_root(files.path())
        .build()
        .unwrap();
    Host {
        manager,
        signer,
        audit,
        egress,
        _files: files,
    }
}

fn host() -> Host {
    start(
        Arc::new(MemoryArtifactStore::new()),
        PluginSigner::generate(),
        Config::default(),
    )
}

fn manifest(id: &str, version: &str, permissions: &[Permission]) -> PluginMetadata {
    PluginMetadata {
        id: id.to_string(),
        name: id.to_string(),
        version: Version::parse(version).unwrap(),
        author: "Integration".to_string(),
        description: String::new(),
        min_api_level: 1,
        max_api_level: None,
        min_host_version: None,
        permissions: permissions.to_vec(),
        dependencies: vec![],
        allowed_hosts: vec![],
        entry_point: EntryPoint::Native("agent".to_string()),
        content_hash: String::new(),
        signature: None,
    }
}

impl Host {
    async fn install(&self, metadata: PluginMetadata, payload: &[u8]) {
        let id = metadata.id.clone();
        let version = metadata.version.clone();
        let bytes = PluginPackage::seal(metadata, payload.to_vec(), &self.signer)
            .unwrap()
            .to_bytes()
            .unwrap();
        self.manager.install(&id, &version, &bytes).await.unwrap();
    }

    async fn run(&self, metadata: PluginMetadata, payload: &[u8]) {
        let id = metadata.id.clone();
        self.install(metadata, payload).await;
        self.manager.load(&id).await.unwrap();
        self.manager.enable(&id).await.unwrap();
    }
}

#[tokio::test]
async fn test_memory_breach_disables_within_the_same_operation() {
    let host = host();
    host.run(manifest("hog", "1.0.0", &[]), b"").await;

    let err = host
        .manager
        .charge("hog", ResourceKind::MemoryBytes, 101 * MB)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::BudgetExceeded(_)));

    let instance = host.manager.get_instance("hog").unwrap();
    assert_eq!(instance.state, PluginState::Disabled);
    assert!(!instance.context_live);
    assert_eq!(
        host.audit
            .events_for("hog", AuditEventKind::BudgetExceeded)
            .len(),
        1
    );
    assert!(matches!(
        host.manager.invoke("hog", "echo", Value::Null).await,
        Err(PluginError::NotEnabled { .. })
    ));

    for kind in [ResourceKind::MemoryBytes, ResourceKind::DiskBytes] {
        assert!(matches!(
            host.manager.charge("hog", kind, 0).await,
            Err(PluginError::BudgetExceeded(_))
        ));
    }
}

#[tokio::test]
async fn test_native_and_wasm_plugins_share_one_contract() {
    let host = host();
    host.run(manifest("native", "1.0.0", &[]), b"").await;

    let mut wasm = manifest("adder", "1.0.0", &[]);
    wasm.entry_point = EntryPoint::Wasm;
    host.run(wasm, ADD_ONE.as_bytes()).await;

    assert_eq!(
        host.manager
            .invoke("native", "echo", json!("hi"))
            .await
            .unwrap(),
        json!("hi")
    );
    assert_eq!(
        host.manager
            .invoke("adder", "handle", json!(41))
            .await
            .unwrap(),
        json!(42)
    );

    let ids: Vec<String> = host
        .manager
        .list_instances()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["adder", "native"]);
}

#[tokio::test]
async fn test_private_directories_are_separate() {
    let host = host();
    let files = [Permission::ReadFiles, Permission::WriteFiles];
    host.run(manifest("alpha", "1.0.0", &files), b"").await;
    host.run(manifest("beta", "1.0.0", &files), b"").await;

    host.manager
        .invoke("alpha", "write", json!({"path": "notes.txt", "text": "secret"}))
        .await
        .unwrap();
    let read = host
        .manager
        .invoke("alpha", "read", json!({"path": "notes.txt"}))
        .await
        .unwrap();
    assert_eq!(read, json!("secret"));

    let other = host
        .manager
        .invoke("beta", "read", json!({"path": "notes.txt"}))
        .await;
    assert!(matches!(other, Err(PluginError::Invocation { .. })));

    let escape = host
        .manager
        .invoke("beta", "read", json!({"path": "../alpha/notes.txt"}))
        .await;
    assert!(matches!(escape, Err(PluginError::Invocation { .. })));
    assert_eq!(
        host.audit
            .events_for("beta", AuditEventKind::PermissionDenied)
            .len(),
        1
    );

    let usage = host.manager.get_instance("alpha").unwrap().usage;
    assert_eq!(usage.disk_bytes, 6);
}

#[tokio::test]
async fn test_write_without_permission_is_denied_and_audited() {
    let host = host();
    host.run(manifest("reader", "1.0.0", &[Permission::ReadFiles]), b"")
        .await;

    let result = host
        .manager
        .invoke("reader", "write", json!({"path": "x", "text": "y"}))
        .await;
    assert!(matches!(result, Err(PluginError::Invocation { .. })));
    assert_eq!(
        host.audit
            .events_for("reader", AuditEventKind::PermissionDenied)
            .len(),
        1
    );
    assert_eq!(
        host.manager.get_instance("reader").unwrap().state,
        PluginState::Enabled
    );
}

#[tokio::test]
async fn test_network_bridge_honours_allow_list() {
    let host = host();
    let mut metadata = manifest("fetcher", "1.0.0", &[Permission::Network]);
    metadata.allowed_hosts = vec!["*.example.com".to_string()];
    host.run(metadata, b"").await;

    let body = host
        .manager
        .invoke("fetcher", "fetch", json!({"url": "https://api.example.com/v1"}))
        .await
        .unwrap();
    assert_eq!(body, json!("pong"));

    for url in [
        "https://example.org/",
        "http://api.example.com/",
        "https://169.254.169.254/latest/meta-data",
        "https://localhost/",
    ] {
        let refused = host
            .manager
            .invoke("fetcher", "fetch", json!({ "url": url }))
            .await;
        assert!(refused.is_err(), "{url} should be refused");
    }

    assert_eq!(
        *host.egress.sent.lock().unwrap(),
        vec!["https://api.example.com/v1".to_string()]
    );
    let usage = host.manager.get_instance("fetcher").unwrap().usage;
    assert!(usage.network_bytes >= 4);
}

#[tokio::test]
async fn test_messages_are_brokered_between_plugins() {
    let host = host();
    host.run(manifest("listener", "1.0.0", &[Permission::Messaging]), b"")
        .await;
    host.run(manifest("speaker", "1.0.0", &[Permission::Messaging]), b"")
        .await;
    host.run(manifest("mute", "1.0.0", &[]), b"").await;

    host.manager
        .invoke("listener", "subscribe", json!({"topic": "news"}))
        .await
        .unwrap();
    let delivered = host
        .manager
        .invoke(
            "speaker",
            "publish",
            json!({"topic": "news", "payload": {"headline": "hello"}}),
        )
        .await
        .unwrap();
    assert_eq!(delivered, json!(1));

    let inbox = host
        .manager
        .invoke("listener", "inbox", Value::Null)
        .await
        .unwrap();
    assert_eq!(
        inbox,
        json!([{ "from": "speaker", "payload": { "headline": "hello" } }])
    );

    let denied = host
        .manager
        .invoke("mute", "publish", json!({"topic": "news", "payload": null}))
        .await;
    assert!(matches!(denied, Err(PluginError::Invocation { .. })));
}

#[tokio::test]
async fn test_install_with_missing_dependency_is_rejected() {
    let host = host();
    let mut app = manifest("app", "1.0.0", &[]);
    app.dependencies.push(Dependency {
        id: "libx".to_string(),
        version_req: "^1.0".parse().unwrap(),
    });

    let bytes = PluginPackage::seal(app, vec![], &host.signer)
        .unwrap()
        .to_bytes()
        .unwrap();
    let err = host
        .manager
        .install("app", &Version::new(1, 0, 0), &bytes)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PluginError::Resolution(ResolutionError::MissingDependency { ref dependency, .. })
            if dependency == "libx"
    ));
    assert!(host.manager.history("app").await.unwrap().is_empty());
    assert_eq!(
        host.audit
            .events_for("app", AuditEventKind::ResolutionFailed)
            .len(),
        1
    );
}

#[tokio::test]
async fn test_rollback_is_atomic_across_restart() {
    let dir = TempDir::new().unwrap();
    let signer_bytes = {
        let host = start(
            Arc::new(FsArtifactStore::new(dir.path())),
            PluginSigner::generate(),
            Config::default(),
        );
        let mut legacy = manifest("app", "1.0.0", &[]);
        legacy.max_api_level = Some(1);
        host.install(legacy, b"v1").await;
        host.install(manifest("app", "2.0.0", &[]), b"v2").await;
        host.signer.to_bytes()
    };

    // The host was upgraded to API level 2; 1.0.0 no longer fits.
    let mut config = Config::default();
    config.host.api_level = 2;
    let host = start(
        Arc::new(FsArtifactStore::new(dir.path())),
        PluginSigner::from_bytes(&signer_bytes).unwrap(),
        config,
    );

    let err = host
        .manager
        .rollback("app", &Version::new(1, 0, 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PluginError::Resolution(ResolutionError::IncompatibleHost { .. })
    ));

    let history = host.manager.history("app").await.unwrap();
    let active: Vec<&Version> = history
        .iter()
        .filter(|r| r.active)
        .map(|r| &r.version)
        .collect();
    assert_eq!(active, vec![&Version::new(2, 0, 0)]);

    let instance = host.manager.load("app").await.unwrap();
    assert_eq!(instance.version, Version::new(2, 0, 0));
}

#[tokio::test]
async fn test_shutdown_unloads_everything() {
    let host = host();
    host.run(manifest("one", "1.0.0", &[]), b"").await;
    host.run(manifest("two", "1.0.0", &[]), b"").await;

    host.manager.shutdown().await;
    assert!(host.manager.list_instances().is_empty());
    for id in ["one", "two"] {
        let transitions = host.audit.events_for(id, AuditEventKind::Transition);
        let last = transitions.last().unwrap().data.as_ref().unwrap();
        assert_eq!(last["to"], "UNLOADED");
    }
}
