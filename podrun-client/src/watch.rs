//! Resynchronizing pod watch
//!
//! Lists the pod, reports what it found, then follows the watch endpoint
//! from the list's resourceVersion. Whenever the watch ends (server-side
//! timeout, expired resourceVersion, transport error) the whole cycle starts
//! over, so the consumer always converges on the pod's current state.

use std::time::Duration;

use futures_util::StreamExt;
use podrun_core::{Pod, PodId};
use reqwest::Method;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ClusterClient;
use crate::error::{ClientError, Result};
use crate::gateway::{PodWatch, WatchEvent};

/// Server closes each watch after this long, which forces a re-list
const WATCH_TIMEOUT_SECONDS: u64 = 300;

const WATCH_CHANNEL_CAPACITY: usize = 64;

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Longest watch frame accepted before the cycle is abandoned
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WatchStatus {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

/// One decoded line of the watch response
#[derive(Debug)]
enum Frame {
    Applied(Pod),
    Deleted(Pod),
    Bookmark,
    Expired,
}

/// Why a single list+watch cycle ended
#[derive(Debug, PartialEq, Eq)]
enum WatchEnd {
    Closed,
    Expired,
    ReceiverGone,
}

impl ClusterClient {
    fn field_selector(id: &PodId) -> String {
        format!("metadata.name={}", id.name)
    }

    async fn list_pods(&self, id: &PodId) -> Result<PodList> {
        let response = self
            .request(Method::GET, &self.pods_url(&id.namespace))
            .query(&[("fieldSelector", Self::field_selector(id))])
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn open_watch(&self, id: &PodId, resource_version: &str) -> Result<reqwest::Response> {
        let response = self
            .request(Method::GET, &self.pods_url(&id.namespace))
            .query(&[
                ("fieldSelector", Self::field_selector(id)),
                ("watch", "true".to_string()),
                ("resourceVersion", resource_version.to_string()),
                ("timeoutSeconds", WATCH_TIMEOUT_SECONDS.to_string()),
            ])
            .send()
            .await?;

        self.handle_stream_response(response).await
    }
}

/// Spawns the background task feeding a [`PodWatch`]
pub(crate) fn spawn_pod_watch(client: ClusterClient, id: PodId) -> PodWatch {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let task = tokio::spawn(async move { watch_loop(client, id, tx).await });
    PodWatch::new(rx, task)
}

async fn watch_loop(client: ClusterClient, id: PodId, tx: mpsc::Sender<WatchEvent>) {
    debug!("Setting up watch for pod {}", id);

    // Last snapshot known to exist, so a deletion missed between two
    // watches is still reported after the re-list.
    let mut last_seen: Option<Pod> = None;

    loop {
        match list_then_watch(&client, &id, &tx, &mut last_seen).await {
            Ok(WatchEnd::ReceiverGone) => {
                debug!("Watch consumer for pod {} went away", id);
                return;
            }
            Ok(WatchEnd::Closed) => debug!("Watch for pod {} closed, resynchronizing", id),
            Ok(WatchEnd::Expired) => debug!("Watch for pod {} expired, re-listing", id),
            Err(e) => {
                warn!("Watch for pod {} failed: {}", id, e);
                if tx.send(WatchEvent::Error(e.to_string())).await.is_err() {
                    return;
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn list_then_watch(
    client: &ClusterClient,
    id: &PodId,
    tx: &mpsc::Sender<WatchEvent>,
    last_seen: &mut Option<Pod>,
) -> Result<WatchEnd> {
    let list = client.list_pods(id).await?;
    let resource_version = list.metadata.resource_version.unwrap_or_default();

    for event in initial_events(id, list.items, last_seen) {
        if tx.send(event).await.is_err() {
            return Ok(WatchEnd::ReceiverGone);
        }
    }

    let response = client.open_watch(id, &resource_version).await?;
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();

    while let Some(chunk) = body.next().await {
        for line in lines.push(&chunk?)? {
            let event = match parse_frame(&line)? {
                Frame::Applied(pod) => {
                    *last_seen = Some(pod.clone());
                    WatchEvent::Applied(pod)
                }
                Frame::Deleted(pod) => {
                    *last_seen = None;
                    WatchEvent::Deleted(pod)
                }
                Frame::Bookmark => continue,
                Frame::Expired => return Ok(WatchEnd::Expired),
            };

            if tx.send(event).await.is_err() {
                return Ok(WatchEnd::ReceiverGone);
            }
        }
    }

    Ok(WatchEnd::Closed)
}

/// Events reporting the outcome of a list, always ending with `Synced`
///
/// A pod seen by an earlier cycle but missing from this list is reported
/// as deleted, using its last known snapshot.
fn initial_events(id: &PodId, items: Vec<Pod>, last_seen: &mut Option<Pod>) -> Vec<WatchEvent> {
    let current = items.into_iter().find(|pod| pod.metadata.name == id.name);

    let mut events = Vec::with_capacity(2);
    match current {
        Some(pod) => {
            *last_seen = Some(pod.clone());
            events.push(WatchEvent::Applied(pod));
        }
        None => events.extend(last_seen.take().map(WatchEvent::Deleted)),
    }
    events.push(WatchEvent::Synced);
    events
}

fn parse_frame(line: &[u8]) -> Result<Frame> {
    let raw: RawWatchEvent = serde_json::from_slice(line)
        .map_err(|e| ClientError::ParseError(format!("Invalid watch event: {}", e)))?;

    let into_pod = |object: serde_json::Value| {
        serde_json::from_value::<Pod>(object)
            .map_err(|e| ClientError::ParseError(format!("Invalid pod in watch event: {}", e)))
    };

    match raw.kind.as_str() {
        "ADDED" | "MODIFIED" => Ok(Frame::Applied(into_pod(raw.object)?)),
        "DELETED" => Ok(Frame::Deleted(into_pod(raw.object)?)),
        "BOOKMARK" => Ok(Frame::Bookmark),
        "ERROR" => {
            let status: WatchStatus = serde_json::from_value(raw.object)
                .map_err(|e| ClientError::ParseError(format!("Invalid watch status: {}", e)))?;
            if status.code == 410 {
                Ok(Frame::Expired)
            } else {
                Err(ClientError::api_error(status.code, status.message))
            }
        }
        other => Err(ClientError::ParseError(format!(
            "Unknown watch event type: {}",
            other
        ))),
    }
}

/// Splits a chunked body into newline-terminated lines
#[derive(Debug)]
struct LineBuffer {
    pending: Vec<u8>,
    /// Bytes of `pending` already known to hold no newline
    scanned: usize,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl LineBuffer {
    fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Appends a chunk and returns every line it completed
    ///
    /// # Returns
    /// A `ParseError` once an unterminated frame grows past the limit
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=self.scanned + offset).collect();
            self.scanned = 0;
            line.pop();
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }
        self.scanned = self.pending.len();

        if self.pending.len() > self.limit {
            let size = self.pending.len();
            self.pending.clear();
            self.scanned = 0;
            return Err(ClientError::ParseError(format!(
                "Watch frame exceeds {} bytes without a line break ({} buffered)",
                self.limit, size
            )));
        }

        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podrun_core::PodPhase;

    #[test]
    fn test_line_buffer_joins_partial_chunks() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.push(b"{\"type\":").unwrap().is_empty());
        let lines = buffer.push(b"\"BOOKMARK\"}\n\n{\"a\":1}\n{\"b\"").unwrap();
        assert_eq!(lines, vec![b"{\"type\":\"BOOKMARK\"}".to_vec(), b"{\"a\":1}".to_vec()]);

        let lines = buffer.push(b":2}\n").unwrap();
        assert_eq!(lines, vec![b"{\"b\":2}".to_vec()]);
    }

    #[test]
    fn test_line_buffer_newline_split_across_many_chunks() {
        let mut buffer = LineBuffer::default();

        for chunk in [&b"{\"a\""[..], b":", b"1", b"}"] {
            assert!(buffer.push(chunk).unwrap().is_empty());
        }
        assert_eq!(buffer.scanned, buffer.pending.len());

        let lines = buffer.push(b"\n{\"b\":2}\n").unwrap();
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert!(buffer.pending.is_empty());
        assert_eq!(buffer.scanned, 0);
    }

    #[test]
    fn test_line_buffer_rejects_oversized_frame() {
        let mut buffer = LineBuffer::with_limit(8);

        assert!(buffer.push(b"{\"a\":").unwrap().is_empty());
        let err = buffer.push(b"\"0123456789\"").unwrap_err();
        assert!(matches!(err, ClientError::ParseError(_)));

        // a fresh frame is accepted afterwards
        assert_eq!(buffer.push(b"{}\n").unwrap(), vec![b"{}".to_vec()]);
    }

    #[test]
    fn test_line_buffer_long_frame_completed_in_one_chunk_is_accepted() {
        let mut buffer = LineBuffer::with_limit(8);

        let lines = buffer.push(b"{\"name\":\"worker\"}\n").unwrap();
        assert_eq!(lines, vec![b"{\"name\":\"worker\"}".to_vec()]);
    }

    fn listed(id: &PodId, phase: PodPhase) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": id.name, "namespace": id.namespace, "resourceVersion": "12"},
            "status": {"phase": phase.to_string()}
        }))
        .unwrap()
    }

    #[test]
    fn test_initial_events_pod_present() {
        let id = PodId::new("worker", "batch");
        let current = listed(&id, PodPhase::Running);
        let mut last_seen = None;

        let events = initial_events(&id, vec![current.clone()], &mut last_seen);

        assert_eq!(events, vec![WatchEvent::Applied(current.clone()), WatchEvent::Synced]);
        assert_eq!(last_seen, Some(current));
    }

    #[test]
    fn test_initial_events_pod_missing_after_being_seen() {
        let id = PodId::new("worker", "batch");
        let seen = listed(&id, PodPhase::Running);
        let mut last_seen = Some(seen.clone());

        let events = initial_events(&id, Vec::new(), &mut last_seen);

        assert_eq!(events, vec![WatchEvent::Deleted(seen), WatchEvent::Synced]);
        assert!(last_seen.is_none());

        // the deletion is reported once, later lists only resync
        let events = initial_events(&id, Vec::new(), &mut last_seen);
        assert_eq!(events, vec![WatchEvent::Synced]);
    }

    #[test]
    fn test_initial_events_pod_never_seen() {
        let id = PodId::new("worker", "batch");
        let mut last_seen = None;

        let events = initial_events(&id, Vec::new(), &mut last_seen);

        assert_eq!(events, vec![WatchEvent::Synced]);
        assert!(last_seen.is_none());
    }

    #[test]
    fn test_initial_events_relist_reports_current_snapshot() {
        let id = PodId::new("worker", "batch");
        let mut last_seen = Some(listed(&id, PodPhase::Pending));
        let current = listed(&id, PodPhase::Succeeded);

        let events = initial_events(&id, vec![current.clone()], &mut last_seen);

        assert_eq!(events, vec![WatchEvent::Applied(current.clone()), WatchEvent::Synced]);
        assert_eq!(last_seen, Some(current));
    }

    #[test]
    fn test_initial_events_ignore_other_pods() {
        let id = PodId::new("worker", "batch");
        let other = listed(&PodId::new("worker-2", "batch"), PodPhase::Running);
        let seen = listed(&id, PodPhase::Running);
        let mut last_seen = Some(seen.clone());

        let events = initial_events(&id, vec![other], &mut last_seen);

        assert_eq!(events, vec![WatchEvent::Deleted(seen), WatchEvent::Synced]);
    }

    #[test]
    fn test_parse_modified_frame() {
        let line = br#"{"type":"MODIFIED","object":{"metadata":{"name":"w","namespace":"n"},"status":{"phase":"Running"}}}"#;
        match parse_frame(line).unwrap() {
            Frame::Applied(pod) => assert_eq!(pod.phase(), PodPhase::Running),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_parse_deleted_frame() {
        let line = br#"{"type":"DELETED","object":{"metadata":{"name":"w","namespace":"n"}}}"#;
        assert!(matches!(parse_frame(line).unwrap(), Frame::Deleted(_)));
    }

    #[test]
    fn test_parse_expired_error_frame() {
        let line = br#"{"type":"ERROR","object":{"kind":"Status","code":410,"message":"too old resource version"}}"#;
        assert!(matches!(parse_frame(line).unwrap(), Frame::Expired));
    }

    #[test]
    fn test_parse_other_error_frame() {
        let line = br#"{"type":"ERROR","object":{"kind":"Status","code":500,"message":"etcd unavailable"}}"#;
        let err = parse_frame(line).unwrap_err();
        assert!(err.is_server_error());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_frame(b"not json"), Err(ClientError::ParseError(_))));
    }

    #[test]
    fn test_field_selector() {
        let id = PodId::new("worker", "batch");
        assert_eq!(ClusterClient::field_selector(&id), "metadata.name=worker");
    }
}
