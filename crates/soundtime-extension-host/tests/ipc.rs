//! End-to-end tests of the serve loop over in-memory pipes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use soundtime_extension_host::{ExtensionHost, HostConfig, HostError};
use soundtime_extensions::sandbox::{EntryPoint, ExtensionInstance, FactoryDescriptor, SandboxContext};
use soundtime_extensions::{
    callback, Envelope, EnvelopeCodec, ExtensionApi, ExtensionError, ExtensionHandler, ExtraEventType, Sandbox,
};
use soundtime_extensions::preferences::PreferenceGroup;

const WAIT: Duration = Duration::from_secs(5);

/// `(package, method, value)` reported by fake extensions.
type Report = (String, String, Value);

// ─── Fake extensions ────────────────────────────────────────────────────

#[derive(Clone)]
struct FakeSandbox {
    reports: mpsc::UnboundedSender<Report>,
    /// Lifecycle method that asks the host for the volume.
    ask_volume_on: Option<&'static str>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn evaluate(
        &self,
        _source: Vec<u8>,
        context: SandboxContext,
    ) -> Result<Arc<dyn EntryPoint>, ExtensionError> {
        context.api.on(
            ExtraEventType::RequestedPlaylists,
            callback(|_| async {
                Ok::<_, ExtensionError>(json!({ "playlists": [{ "playlist_id": "p1", "playlist_name": "Mix" }] }))
            }),
        );
        Ok(Arc::new(FakeModule {
            package: context.package_name,
            api: context.api,
            sandbox: self.clone(),
        }))
    }
}

struct FakeModule {
    package: String,
    api: Arc<ExtensionApi>,
    sandbox: FakeSandbox,
}

#[async_trait]
impl EntryPoint for FakeModule {
    async fn descriptors(&self) -> Result<Option<Vec<FactoryDescriptor>>, ExtensionError> {
        Ok(Some(vec![FactoryDescriptor {
            create: Some("create".into()),
            ..Default::default()
        }]))
    }

    async fn preferences(&self, _export: &str) -> Result<Vec<PreferenceGroup>, ExtensionError> {
        Ok(Vec::new())
    }

    async fn create(&self, _export: &str) -> Result<Arc<dyn ExtensionInstance>, ExtensionError> {
        Ok(Arc::new(FakeInstance {
            package: self.package.clone(),
            api: self.api.clone(),
            sandbox: self.sandbox.clone(),
        }))
    }
}

struct FakeInstance {
    package: String,
    api: Arc<ExtensionApi>,
    sandbox: FakeSandbox,
}

impl FakeInstance {
    fn report(&self, method: &str, value: Value) {
        let _ = self
            .sandbox
            .reports
            .send((self.package.clone(), method.to_string(), value));
    }
}

#[async_trait]
impl ExtensionInstance for FakeInstance {
    fn has_method(&self, _method: &str) -> bool {
        true
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value, ExtensionError> {
        self.report(method, args);
        if self.sandbox.ask_volume_on == Some(method) {
            let volume = self.api.get_volume().await?;
            self.report("volume", volume.unwrap_or(Value::Null));
        }
        Ok(Value::Null)
    }
}

fn write_extension(root: &Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("package.json"),
        json!({
            "soundtimeExtension": true,
            "name": name,
            "displayName": format!("{name} display"),
            "version": "1.0.0",
            "extensionEntry": "index.wasm",
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(dir.join("index.wasm"), b"\0asm").unwrap();
}

// ─── Harness ────────────────────────────────────────────────────────────

struct Harness {
    to_host: FramedWrite<DuplexStream, EnvelopeCodec>,
    from_host: FramedRead<DuplexStream, EnvelopeCodec>,
    reports: mpsc::UnboundedReceiver<Report>,
    handler: Arc<ExtensionHandler>,
    shutdown: CancellationToken,
    run: JoinHandle<Result<(), HostError>>,
    next_channel: u32,
    _dir: tempfile::TempDir,
}

fn start(extensions: &[&str], ask_volume_on: Option<&'static str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    for name in extensions {
        write_extension(dir.path(), name);
    }
    let config = HostConfig::from_args([
        "-ipcPath",
        "unused",
        "-extensionPath",
        dir.path().to_str().unwrap(),
    ])
    .unwrap();

    let (reports_tx, reports) = mpsc::unbounded_channel();
    let sandbox = Arc::new(FakeSandbox {
        reports: reports_tx,
        ask_volume_on,
    });
    let host = ExtensionHost::new(&config, sandbox);
    let handler = host.handler().clone();
    let shutdown = host.shutdown_token();

    let (client_out, host_in) = tokio::io::duplex(64 * 1024);
    let (host_out, client_in) = tokio::io::duplex(64 * 1024);
    let run = tokio::spawn(host.run(host_in, host_out));

    Harness {
        to_host: FramedWrite::new(client_out, EnvelopeCodec::new()),
        from_host: FramedRead::new(client_in, EnvelopeCodec::new()),
        reports,
        handler,
        shutdown,
        run,
        next_channel: 0,
        _dir: dir,
    }
}

impl Harness {
    async fn send(&mut self, envelope: Envelope) {
        self.to_host.send(envelope).await.unwrap();
    }

    async fn next_envelope(&mut self) -> Envelope {
        tokio::time::timeout(WAIT, self.from_host.next())
            .await
            .expect("timed out waiting for the host")
            .expect("host closed the channel")
            .expect("undecodable envelope")
    }

    /// Next extension request of `kind`, skipping other outbound messages.
    async fn next_request(&mut self, kind: &str) -> Envelope {
        loop {
            let envelope = self.next_envelope().await;
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    /// Send a host message and wait for the reply on its channel.
    async fn request(&mut self, kind: &str, data: Option<Value>) -> Envelope {
        self.next_channel += 1;
        let channel = format!("host-{}", self.next_channel);
        let mut envelope = Envelope::new(kind, channel.clone());
        envelope.data = data;
        self.send(envelope).await;
        loop {
            let reply = self.next_envelope().await;
            if reply.channel == channel {
                return reply;
            }
        }
    }

    async fn wait_for_report(&mut self, package: &str, method: &str) -> Value {
        loop {
            let (p, m, value) = tokio::time::timeout(WAIT, self.reports.recv())
                .await
                .expect("timed out waiting for the extension")
                .expect("reports closed");
            if p == package && m == method {
                return value;
            }
        }
    }

    async fn wait_started(&self) {
        tokio::time::timeout(WAIT, async {
            loop {
                let installed = self.handler.get_installed_extensions();
                if !installed.is_empty() && installed.iter().all(|e| e.has_started) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("extensions never started");
    }

    async fn finish(self) -> Result<(), HostError> {
        tokio::time::timeout(WAIT, self.run)
            .await
            .expect("host did not stop")
            .unwrap()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reply_echoes_request() {
    let mut h = start(&["alpha"], None);

    let reply = h.request("getInstalledExtensions", None).await;
    assert_eq!(reply.kind, "getInstalledExtensions");
    assert_eq!(reply.channel, "host-1");
    let installed = reply.data.unwrap();
    assert_eq!(installed.as_array().unwrap().len(), 1);
    assert_eq!(installed[0]["packageName"], "alpha");
    assert_eq!(installed[0]["name"], "alpha display");

    h.send(
        Envelope::new("getDisplayName", "named")
            .with_data(json!({ "packageName": "alpha" }))
            .with_extension_name("caller"),
    )
    .await;
    let reply = h.next_envelope().await;
    assert_eq!(reply.channel, "named");
    assert_eq!(reply.extension_name.as_deref(), Some("caller"));
    assert_eq!(reply.data, Some(json!("alpha display")));
}

#[tokio::test]
async fn test_unknown_type_gets_null_reply() {
    let mut h = start(&[], None);
    let reply = h.request("somethingElse", Some(json!({ "x": 1 }))).await;
    assert_eq!(reply.kind, "somethingElse");
    assert_eq!(reply.data, Some(Value::Null));
}

#[tokio::test]
async fn test_extension_request_is_correlated_with_host_reply() {
    let mut h = start(&["alpha"], Some("onStarted"));

    let request = h.next_request("get-volume").await;
    assert_eq!(request.extension_name.as_deref(), Some("alpha"));
    assert!(!request.channel.is_empty());

    h.send(Envelope::new("get-volume", request.channel).with_data(json!(0.5)))
        .await;
    assert_eq!(h.wait_for_report("alpha", "volume").await, json!(0.5));
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let mut h = start(&["alpha"], None);

    h.to_host
        .get_mut()
        .write_all(b"this is not json\n{\"broken\":\n")
        .await
        .unwrap();
    let reply = h
        .request("getDisplayName", Some(json!({ "packageName": "alpha" })))
        .await;
    assert_eq!(reply.data, Some(json!("alpha display")));
}

#[tokio::test]
async fn test_extra_event_responses_are_namespaced() {
    let mut h = start(&["alpha"], None);
    h.wait_started().await;

    let reply = h
        .request(
            "extraExtensionEvents",
            Some(json!({ "type": "requestedPlaylists", "data": [false] })),
        )
        .await;
    let playlist = &reply.data.unwrap()["alpha"]["playlists"][0];
    assert_eq!(playlist["playlist_id"], "alpha:p1");
    assert_eq!(playlist["extension"], "alpha");
    assert_eq!(playlist["isLocal"], None);
    assert_eq!(playlist["playlist_name"], "Mix");
}

#[tokio::test]
async fn test_provider_scopes_follow_registered_callbacks() {
    let mut h = start(&["alpha"], None);
    let reply = h
        .request(
            "getExtensionProviderScopes",
            Some(json!({ "packageName": "alpha" })),
        )
        .await;
    assert_eq!(reply.data, Some(json!({ "alpha": ["PLAYLISTS"] })));
}

#[tokio::test]
async fn test_toggle_extension_status() {
    let mut h = start(&["alpha"], None);
    h.wait_started().await;

    h.request(
        "toggleExtensionStatus",
        Some(json!({ "packageName": "alpha", "enabled": false })),
    )
    .await;
    assert_eq!(h.wait_for_report("alpha", "onStopped").await, Value::Null);
    assert!(!h.handler.get_installed_extensions()[0].has_started);
}

#[tokio::test]
async fn test_stop_process_stops_extensions_and_exits() {
    let mut h = start(&["alpha"], None);
    h.wait_started().await;

    let reply = h.request("stopProcess", None).await;
    assert_eq!(reply.data, Some(Value::Null));

    h.wait_for_report("alpha", "onStopped").await;
    h.finish().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_answers_requests_made_while_stopping() {
    let mut h = start(&["alpha"], Some("onStopped"));
    h.wait_started().await;

    h.shutdown.cancel();
    let request = h.next_request("get-volume").await;
    assert_eq!(request.extension_name.as_deref(), Some("alpha"));
    h.send(Envelope::new("get-volume", request.channel).with_data(json!(0.25)))
        .await;

    assert_eq!(h.wait_for_report("alpha", "volume").await, json!(0.25));
    let handler = h.handler.clone();
    h.finish().await.unwrap();
    assert!(!handler.get_installed_extensions()[0].has_started);
}

#[tokio::test]
async fn test_shutdown_token_stops_host() {
    let mut h = start(&["alpha"], None);
    h.wait_started().await;

    h.shutdown.cancel();
    h.wait_for_report("alpha", "onStopped").await;
    h.finish().await.unwrap();
}

#[tokio::test]
async fn test_closed_channel_is_fatal() {
    let h = start(&["alpha"], None);
    h.wait_started().await;

    let Harness {
        to_host,
        run,
        handler,
        _dir,
        ..
    } = h;
    drop(to_host);

    let err = tokio::time::timeout(WAIT, run)
        .await
        .expect("host did not stop")
        .unwrap()
        .unwrap_err();
    assert!(err.is_channel_closed());
    // Extensions are not stopped on a closed channel.
    assert!(handler.get_installed_extensions()[0].has_started);
}
