//! Backend Transport.
//!
//! Ships queued agent payloads to the ingest backend, tracks backend
//! health through a small state machine, and throttles reconnection
//! attempts with a grace-period backoff.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::signal::OnceSignal;

/// Content-encoding an agent declared for a payload body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    None,
    Gzip,
    Deflate,
}

/// A single buffered agent payload, queued verbatim (still in the agent's
/// original encoding) until posted or dropped.
#[derive(Debug, Clone)]
pub struct AgentPayload {
    pub bytes: Vec<u8>,
    pub encoding: Encoding,
}

/// Backend health state. `Healthy ⇔ reconnection_count == -1` is
/// maintained as an invariant by every transition in this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Healthy,
    Failing,
    Pending,
}

struct StateInner {
    state: TransportState,
    reconnection_count: i64,
    /// Whether the one permitted probe request in `Pending` has been
    /// claimed by an in-flight `post_to_backend` call.
    probe_claimed: bool,
}

/// Grace duration before a `Failing` transport is allowed to probe again.
///
/// `grace(n) = min(n, 6)^2` seconds: 0, 1, 4, 9, 16, 25, 36, 36, 36, ...
pub fn grace_period(reconnection_count: i64) -> Duration {
    let n = reconnection_count.clamp(0, 6) as u64;
    Duration::from_secs(n * n)
}

/// Ships buffered telemetry to the ingest backend.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportData>,
}

struct TransportData {
    queue: Mutex<VecDeque<AgentPayload>>,
    queue_capacity: usize,
    state: Mutex<StateInner>,
    client: reqwest::Client,
    apm_server_url: String,
    auth_header: Option<String>,
    forwarder_timeout: Duration,
    agent_done: std::sync::RwLock<Arc<OnceSignal>>,
    dropped_payloads_total: AtomicU64,
    decode_errors_total: AtomicU64,
}

impl Transport {
    pub fn new(
        apm_server_url: String,
        auth_header: Option<String>,
        forwarder_timeout: Duration,
        queue_capacity: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(forwarder_timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(TransportData {
                queue: Mutex::new(VecDeque::with_capacity(queue_capacity.min(1024))),
                queue_capacity,
                state: Mutex::new(StateInner {
                    state: TransportState::Healthy,
                    reconnection_count: -1,
                    probe_claimed: false,
                }),
                client,
                apm_server_url,
                auth_header,
                forwarder_timeout,
                agent_done: std::sync::RwLock::new(Arc::new(OnceSignal::new())),
                dropped_payloads_total: AtomicU64::new(0),
                decode_errors_total: AtomicU64::new(0),
            }),
        })
    }

    /// Non-blocking: push a payload onto the bounded FIFO. If full, the
    /// oldest payload is dropped and `dropped_payloads_total` incremented —
    /// telemetry is best-effort, never a reason to block the Receiver.
    pub async fn enqueue(&self, payload: AgentPayload) {
        let mut queue = self.inner.queue.lock().await;
        if queue.len() >= self.inner.queue_capacity {
            queue.pop_front();
            self.inner
                .dropped_payloads_total
                .fetch_add(1, Ordering::Relaxed);
            warn!("forwarder queue full; dropped oldest payload");
        }
        queue.push_back(payload);
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    async fn dequeue(&self) -> Option<AgentPayload> {
        self.inner.queue.lock().await.pop_front()
    }

    /// Non-blocking pop used by the per-invocation Forwarder task.
    pub async fn try_dequeue(&self) -> Option<AgentPayload> {
        self.dequeue().await
    }

    pub fn dropped_payloads_total(&self) -> u64 {
        self.inner.dropped_payloads_total.load(Ordering::Relaxed)
    }

    pub fn record_decode_error(&self) {
        self.inner
            .decode_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_errors_total(&self) -> u64 {
        self.inner.decode_errors_total.load(Ordering::Relaxed)
    }

    pub async fn state(&self) -> TransportState {
        self.inner.state.lock().await.state
    }

    pub async fn reconnection_count(&self) -> i64 {
        self.inner.state.lock().await.reconnection_count
    }

    /// State-machine transitions. `SetState(Pending)` from `Healthy` is an
    /// explicit no-op (illegal transition per spec).
    pub async fn set_state(&self, new_state: TransportState) {
        let mut st = self.inner.state.lock().await;
        match new_state {
            TransportState::Healthy => {
                st.state = TransportState::Healthy;
                st.reconnection_count = -1;
                st.probe_claimed = false;
            }
            TransportState::Pending => {
                if st.state == TransportState::Healthy {
                    debug!("ignoring illegal Healthy -> Pending transition");
                    return;
                }
                st.state = TransportState::Pending;
                st.probe_claimed = false;
            }
            TransportState::Failing => {
                if st.state == TransportState::Failing {
                    return;
                }
                st.reconnection_count = (st.reconnection_count + 1).max(1);
                st.state = TransportState::Failing;
                let grace = grace_period(st.reconnection_count);
                let reconnection_count = st.reconnection_count;
                drop(st);
                warn!(
                    reconnection_count,
                    grace_secs = grace.as_secs(),
                    "backend transport failing; scheduling pending retry"
                );
                self.schedule_pending_transition(grace);
            }
        }
    }

    fn schedule_pending_transition(&self, grace: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.set_state(TransportState::Pending).await;
        });
    }

    /// Perform one HTTP POST of the queue's concatenated bytes. Ensures
    /// the body is gzip-encoded regardless of the agent's own encoding of
    /// each block (each block is itself an ndjson fragment; the transport
    /// only re-encodes the envelope, not the blocks' content).
    pub async fn post_to_backend(&self, body: &[u8]) -> Result<()> {
        let allowed = {
            let mut st = self.inner.state.lock().await;
            match st.state {
                TransportState::Healthy => true,
                TransportState::Failing => false,
                TransportState::Pending => {
                    if st.probe_claimed {
                        false
                    } else {
                        st.probe_claimed = true;
                        true
                    }
                }
            }
        };

        if !allowed {
            return Err(Error::Backend(
                "transport is unhealthy; short-circuited without a network call".to_string(),
            ));
        }

        match self.do_post(body).await {
            Ok(()) => {
                self.set_state(TransportState::Healthy).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(TransportState::Failing).await;
                Err(e)
            }
        }
    }

    async fn do_post(&self, body: &[u8]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body)?;
        let compressed = encoder.finish()?;

        let mut request = self
            .inner
            .client
            .post(format!("{}/intake/v2/events", self.inner.apm_server_url))
            .header("Content-Encoding", "gzip")
            .header("Content-Type", "application/x-ndjson")
            .body(compressed);

        if let Some(auth) = &self.inner.auth_header {
            request = request.header("Authorization", auth);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Backend(format!(
                "ingest backend responded with status {status}"
            )))
        }
    }

    /// Drain the queue synchronously, one payload per POST, until empty or
    /// `cancel` fires.
    pub async fn flush(&self, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                debug!("flush cancelled with payloads possibly still queued");
                return;
            }
            let payload = match self.dequeue().await {
                Some(p) => p,
                None => return,
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("flush cancelled mid-post; payload dropped (best-effort)");
                    return;
                }
                result = self.post_to_backend(&payload.bytes) => {
                    if let Err(e) = result {
                        warn!(error = %e, "flush: payload not acknowledged");
                    }
                }
            }
        }
    }

    /// Start a fresh per-invocation `AgentDoneSignal` and return a handle
    /// to it. Called once by the Coordinator at the top of each
    /// invocation; the previous invocation's signal is dropped.
    pub fn begin_invocation(&self) -> Arc<OnceSignal> {
        let signal = Arc::new(OnceSignal::new());
        *self.inner.agent_done.write().unwrap() = signal.clone();
        signal
    }

    /// Fire the current invocation's `AgentDoneSignal` (called by the
    /// Agent Receiver's flush route).
    pub fn fire_agent_done(&self) {
        self.inner.agent_done.read().unwrap().fire();
    }

    pub fn agent_done_signal(&self) -> Arc<OnceSignal> {
        self.inner.agent_done.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        Transport::new(
            "http://127.0.0.1:1".to_string(),
            None,
            Duration::from_millis(50),
            4,
        )
        .unwrap()
    }

    #[test]
    fn test_grace_period_formula() {
        let expected = [0u64, 1, 4, 9, 16, 25, 36, 36, 36];
        for (n, want) in expected.iter().enumerate() {
            assert_eq!(grace_period(n as i64).as_secs(), *want, "n={n}");
        }
    }

    #[tokio::test]
    async fn test_healthy_invariant_on_construction() {
        let t = transport();
        assert_eq!(t.state().await, TransportState::Healthy);
        assert_eq!(t.reconnection_count().await, -1);
    }

    #[tokio::test]
    async fn test_set_state_pending_from_healthy_is_noop() {
        let t = transport();
        t.set_state(TransportState::Pending).await;
        assert_eq!(t.state().await, TransportState::Healthy);
        assert_eq!(t.reconnection_count().await, -1);
    }

    #[tokio::test]
    async fn test_failing_increments_reconnection_count_once() {
        let t = transport();
        t.set_state(TransportState::Failing).await;
        assert_eq!(t.state().await, TransportState::Failing);
        assert_eq!(t.reconnection_count().await, 1);

        // Redundant Failing->Failing does not double-count.
        t.set_state(TransportState::Failing).await;
        assert_eq!(t.reconnection_count().await, 1);
    }

    #[tokio::test]
    async fn test_recovery_resets_reconnection_count() {
        let t = transport();
        t.set_state(TransportState::Failing).await;
        t.set_state(TransportState::Pending).await;
        assert_eq!(t.state().await, TransportState::Pending);

        t.set_state(TransportState::Healthy).await;
        assert_eq!(t.state().await, TransportState::Healthy);
        assert_eq!(t.reconnection_count().await, -1);
    }

    #[tokio::test]
    async fn test_failing_short_circuits_post_without_network_call() {
        let t = transport();
        t.set_state(TransportState::Failing).await;
        let result = t.post_to_backend(b"{}\n").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pending_allows_exactly_one_probe() {
        let t = transport();
        t.set_state(TransportState::Failing).await;
        t.set_state(TransportState::Pending).await;

        // First call claims the probe (and will fail fast against the
        // unroutable address, but it *attempted* the network call rather
        // than short-circuiting — the state flips to Failing as a result).
        let _ = t.post_to_backend(b"{}\n").await;
        assert_eq!(t.state().await, TransportState::Failing);
    }

    #[tokio::test]
    async fn test_enqueue_drops_oldest_when_full() {
        let t = transport();
        for i in 0..5u8 {
            t.enqueue(AgentPayload {
                bytes: vec![i],
                encoding: Encoding::None,
            })
            .await;
        }
        assert_eq!(t.queue_len().await, 4);
        assert_eq!(t.dropped_payloads_total(), 1);

        let first = t.dequeue().await.unwrap();
        assert_eq!(first.bytes, vec![1]);
    }

    #[tokio::test]
    async fn test_agent_done_signal_is_per_invocation() {
        let t = transport();
        let first = t.begin_invocation();
        t.fire_agent_done();
        assert!(first.is_fired());

        let second = t.begin_invocation();
        assert!(!second.is_fired());
    }

    #[tokio::test]
    async fn test_flush_drains_until_empty() {
        let t = transport();
        t.set_state(TransportState::Failing).await;
        for i in 0..3u8 {
            t.enqueue(AgentPayload {
                bytes: vec![i],
                encoding: Encoding::None,
            })
            .await;
        }
        let cancel = CancellationToken::new();
        t.flush(&cancel).await;
        assert_eq!(t.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_stops_on_cancellation() {
        let t = transport();
        for i in 0..3u8 {
            t.enqueue(AgentPayload {
                bytes: vec![i],
                encoding: Encoding::None,
            })
            .await;
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        t.flush(&cancel).await;
        // Cancelled before the first dequeue check; nothing is guaranteed
        // to have drained, but it also must not hang.
        assert!(t.queue_len().await <= 3);
    }
}
