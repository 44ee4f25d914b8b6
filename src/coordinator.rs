//! Invocation Coordinator.
//!
//! The per-invocation orchestrator: derives an invocation-scoped
//! cancellation, starts the background Forwarder, races the completion
//! signals against the deadline, and enforces the flush policy before
//! returning control to the host.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SendStrategy;
use crate::lifecycle::{Event, InvocationCtx, LifecycleClient};
use crate::logs::LogsReceiver;
use crate::transport::Transport;

/// Upper bound on how long the final `Shutdown` drain is allowed to run.
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Which signal ended the invocation's wait — observable only via logs;
/// every reason leads to the same downstream actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    AgentDone,
    RuntimeDone,
    Timer,
}

pub struct Coordinator {
    lifecycle: LifecycleClient,
    transport: Transport,
    logs_receiver: LogsReceiver,
    send_strategy: SendStrategy,
    global_cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        lifecycle: LifecycleClient,
        transport: Transport,
        logs_receiver: LogsReceiver,
        send_strategy: SendStrategy,
        global_cancel: CancellationToken,
    ) -> Self {
        Self {
            lifecycle,
            transport,
            logs_receiver,
            send_strategy,
            global_cancel,
        }
    }

    /// Runs the `NextEvent` loop until a `Shutdown` event or global
    /// cancellation.
    pub async fn run(&mut self) {
        loop {
            let event = tokio::select! {
                _ = self.global_cancel.cancelled() => {
                    info!("global shutdown; exiting coordinator loop");
                    return;
                }
                event = self.lifecycle.next_event() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "next_event failed; retrying");
                    continue;
                }
            };

            match event {
                Event::Shutdown => {
                    info!("received SHUTDOWN event");
                    self.global_cancel.cancel();
                    self.drain_on_shutdown().await;
                    return;
                }
                Event::Invoke(ctx) => {
                    self.handle_invocation(ctx).await;
                }
            }
        }
    }

    async fn drain_on_shutdown(&self) {
        let drain_cancel = CancellationToken::new();
        let timeout_token = drain_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_DRAIN_BUDGET).await;
            timeout_token.cancel();
        });
        self.transport.flush(&drain_cancel).await;
    }

    async fn handle_invocation(&mut self, ctx: InvocationCtx) {
        let start_ms = now_millis();
        let timeout_ms = (ctx.deadline_ms - start_ms).max(0) as f64;

        let invocation_cancel = self.global_cancel.child_token();
        let agent_done = self.transport.begin_invocation();
        self.logs_receiver
            .begin_invocation(ctx.request_id.clone(), timeout_ms);

        let forwarder = tokio::spawn(run_forwarder(
            self.transport.clone(),
            agent_done.clone(),
            invocation_cancel.clone(),
        ));

        let flush_deadline_ms = ctx.flush_deadline_ms();
        let remaining_until_flush_deadline =
            Duration::from_millis((flush_deadline_ms - start_ms).max(0) as u64);
        let timer = tokio::time::sleep(remaining_until_flush_deadline);
        tokio::pin!(timer);

        // Agent > Runtime > Timer precedence when multiple signals are
        // ready in the same poll. The runtime-done wait goes through the
        // Logs Receiver's `WaitRuntimeDone` operation (spec.md §4.4/§4.5's
        // LogsWatcher), not a bare signal await.
        let reason = tokio::select! {
            biased;
            _ = agent_done.wait() => CompletionReason::AgentDone,
            _ = self.logs_receiver.wait_runtime_done(&invocation_cancel) => CompletionReason::RuntimeDone,
            _ = &mut timer => CompletionReason::Timer,
        };

        info!(
            request_id = %ctx.request_id,
            reason = ?reason,
            "invocation completion signal observed"
        );

        invocation_cancel.cancel();
        let _ = forwarder.await;

        if self.send_strategy == SendStrategy::SyncFlush {
            let remaining_until_deadline =
                Duration::from_millis((ctx.deadline_ms - now_millis()).max(0) as u64);
            let flush_cancel = CancellationToken::new();
            let timeout_token = flush_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(remaining_until_deadline).await;
                timeout_token.cancel();
            });
            self.transport.flush(&flush_cancel).await;
        }
    }
}

/// Repeatedly dequeue from the Transport and post to the backend.
/// Terminates on invocation cancellation, or once the queue is empty *and*
/// the agent has signaled done.
async fn run_forwarder(
    transport: Transport,
    agent_done: std::sync::Arc<crate::signal::OnceSignal>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match transport.try_dequeue().await {
            Some(payload) => {
                if let Err(e) = transport.post_to_backend(&payload.bytes).await {
                    warn!(error = %e, "forwarder: payload not acknowledged");
                }
            }
            None => {
                if agent_done.is_fired() {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataCache;
    use crate::transport::{AgentPayload, Encoding};

    fn transport() -> Transport {
        Transport::new(
            "http://127.0.0.1:1".to_string(),
            None,
            Duration::from_millis(20),
            16,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_forwarder_stops_when_empty_and_agent_done() {
        let t = transport();
        let agent_done = t.begin_invocation();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_forwarder(t.clone(), agent_done.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent_done.fire();

        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("forwarder should stop shortly after agent_done fires")
            .unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_stops_on_cancellation_even_with_queued_items() {
        let t = transport();
        t.enqueue(AgentPayload {
            bytes: b"{}\n".to_vec(),
            encoding: Encoding::None,
        })
        .await;
        let agent_done = t.begin_invocation();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handle = tokio::spawn(run_forwarder(t, agent_done, cancel));
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("forwarder should stop promptly on cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_completion_reason_precedence_agent_over_timer() {
        let t = transport();
        let agent_done = t.begin_invocation();
        let logs_receiver = LogsReceiver::new(t.clone(), MetadataCache::new());
        logs_receiver.begin_invocation("req-1".to_string(), 5000.0);
        let cancel = CancellationToken::new();

        agent_done.fire();
        let timer = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(timer);

        let reason = tokio::select! {
            biased;
            _ = agent_done.wait() => CompletionReason::AgentDone,
            _ = logs_receiver.wait_runtime_done(&cancel) => CompletionReason::RuntimeDone,
            _ = &mut timer => CompletionReason::Timer,
        };
        assert_eq!(reason, CompletionReason::AgentDone);
    }
}
