//! In-memory cluster used by the runner's tests

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use podrun_client::{ClientError, LogOptions, LogStream, PodGateway, PodWatch, WatchEvent};
use podrun_core::{ObjectMeta, Pod, PodId, PodManifest, PodPhase, PodStatus};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::service::{OutputFactory, OutputSink};

/// Builds a pod snapshot in the given phase
pub fn pod(id: &PodId, phase: PodPhase, resource_version: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: id.name.clone(),
            namespace: Some(id.namespace.clone()),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase),
            ..Default::default()
        }),
    }
}

/// Builds a manifest for the given pod
pub fn manifest(id: &PodId) -> PodManifest {
    PodManifest {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta {
            name: id.name.clone(),
            namespace: Some(id.namespace.clone()),
            ..Default::default()
        },
        spec: serde_json::json!({"containers": [{"name": "main", "image": "busybox"}]}),
        status: None,
    }
}

/// Polls `condition` until it holds, panicking after a few seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Debug, Clone)]
enum LogScript {
    Output(Vec<u8>),
    Fail,
    Endless,
}

#[derive(Default)]
struct ClusterState {
    pods: HashMap<String, Pod>,
    watchers: Vec<(String, mpsc::Sender<WatchEvent>)>,
    next_version: u64,
    delete_preconditions: Vec<Option<String>>,
    journal: Vec<String>,
}

impl ClusterState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        format!("{}", 100 + self.next_version)
    }

    fn broadcast(&mut self, key: &str, event: WatchEvent) {
        self.watchers.retain(|(_, tx)| !tx.is_closed());
        for (watched, tx) in &self.watchers {
            if watched == key {
                let _ = tx.try_send(event.clone());
            }
        }
    }
}

/// Scripted stand-in for the cluster
///
/// Pods live in a map; tests move them through phases with
/// [`FakeGateway::set_phase`] and every open watch sees the change.
pub struct FakeGateway {
    state: Mutex<ClusterState>,
    logs: LogScript,
    create_error: Option<u16>,
    create_delay: Option<Duration>,
    fail_delete: bool,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    log_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            logs: LogScript::Output(Vec::new()),
            create_error: None,
            create_delay: None,
            fail_delete: false,
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.state.lock().pods.insert(pod.id().to_string(), pod);
        self
    }

    pub fn with_log_output(mut self, output: &[u8]) -> Self {
        self.logs = LogScript::Output(output.to_vec());
        self
    }

    pub fn with_failing_logs(mut self) -> Self {
        self.logs = LogScript::Fail;
        self
    }

    pub fn with_endless_logs(mut self) -> Self {
        self.logs = LogScript::Endless;
        self
    }

    pub fn with_failing_create(mut self, status: u16) -> Self {
        self.create_error = Some(status);
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn with_failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    /// Moves a pod to `phase` and notifies open watches
    pub fn set_phase(&self, id: &PodId, phase: PodPhase) {
        let key = id.to_string();
        let mut state = self.state.lock();
        let version = state.bump_version();
        let Some(pod) = state.pods.get_mut(&key) else {
            panic!("no pod {} to move to {}", key, phase);
        };
        pod.metadata.resource_version = Some(version);
        pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase);
        let snapshot = pod.clone();

        state.journal.push(format!("phase:{}", phase));
        state.broadcast(&key, WatchEvent::Applied(snapshot));
    }

    /// Removes a pod behind the runner's back
    pub fn remove_pod(&self, id: &PodId) {
        let key = id.to_string();
        let mut state = self.state.lock();
        if let Some(pod) = state.pods.remove(&key) {
            state.journal.push("removed".to_string());
            state.broadcast(&key, WatchEvent::Deleted(pod));
        }
    }

    /// Delivers a raw event to open watches without touching the pod map
    pub fn send_event(&self, id: &PodId, event: WatchEvent) {
        self.state.lock().broadcast(&id.to_string(), event);
    }

    pub fn pod(&self, id: &PodId) -> Option<Pod> {
        self.state.lock().pods.get(&id.to_string()).cloned()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn delete_preconditions(&self) -> Vec<Option<String>> {
        self.state.lock().delete_preconditions.clone()
    }

    /// Gateway calls and phase changes in the order they happened
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }
}

#[async_trait]
impl PodGateway for FakeGateway {
    async fn create_pod(&self, manifest: &PodManifest) -> podrun_client::Result<Pod> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().journal.push("create".to_string());

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.create_error {
            return Err(ClientError::api_error(status, "admission webhook denied the request"));
        }

        let id = manifest.id();
        let key = id.to_string();
        let mut state = self.state.lock();
        if state.pods.contains_key(&key) {
            return Err(ClientError::api_error(409, format!("pods \"{}\" already exists", id.name)));
        }

        let version = state.bump_version();
        let created = pod(&id, PodPhase::Pending, &version);
        state.pods.insert(key.clone(), created.clone());
        state.broadcast(&key, WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn get_pod(&self, id: &PodId) -> podrun_client::Result<Option<Pod>> {
        let mut state = self.state.lock();
        state.journal.push("get".to_string());
        Ok(state.pods.get(&id.to_string()).cloned())
    }

    async fn delete_pod(&self, id: &PodId, precondition: Option<&str>) -> podrun_client::Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let key = id.to_string();
        let mut state = self.state.lock();
        state.journal.push("delete".to_string());
        state.delete_preconditions.push(precondition.map(str::to_string));

        if self.fail_delete {
            return Err(ClientError::api_error(500, "etcdserver: request timed out"));
        }

        let Some(existing) = state.pods.get(&key) else {
            return Err(ClientError::NotFound(key));
        };
        if let Some(expected) = precondition {
            if existing.resource_version() != Some(expected) {
                return Err(ClientError::api_error(409, "precondition failed"));
            }
        }

        if let Some(removed) = state.pods.remove(&key) {
            state.broadcast(&key, WatchEvent::Deleted(removed));
        }
        Ok(())
    }

    async fn watch_pod(&self, id: &PodId) -> podrun_client::Result<PodWatch> {
        let key = id.to_string();
        let (tx, rx) = mpsc::channel(64);

        let mut state = self.state.lock();
        state.journal.push("watch".to_string());
        if let Some(current) = state.pods.get(&key) {
            let _ = tx.try_send(WatchEvent::Applied(current.clone()));
        }
        let _ = tx.try_send(WatchEvent::Synced);
        state.watchers.push((key, tx));
        // counted once the watch is registered so tests can drive phases
        self.watch_calls.fetch_add(1, Ordering::SeqCst);

        Ok(PodWatch::from_receiver(rx))
    }

    async fn pod_logs(&self, id: &PodId, _options: LogOptions) -> podrun_client::Result<LogStream> {
        self.state.lock().journal.push("logs".to_string());
        self.log_calls.fetch_add(1, Ordering::SeqCst);

        match &self.logs {
            LogScript::Output(output) => {
                Ok(stream::iter(vec![Ok(output.clone())]).boxed())
            }
            LogScript::Fail => Err(ClientError::api_error(
                400,
                format!("container \"main\" in pod \"{}\" is waiting to start", id.name),
            )),
            LogScript::Endless => Ok(stream::pending::<podrun_client::Result<Vec<u8>>>().boxed()),
        }
    }
}

/// Cloneable in-memory output sink
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn sink(&self) -> OutputSink {
        Box::new(self.clone())
    }

    pub fn factory(&self) -> OutputFactory {
        let buffer = self.clone();
        Arc::new(move || buffer.sink())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
