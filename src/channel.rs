//! Reliable sync channel between two peers.
//!
//! One [`SyncChannel`] exists per physical peer session. It announces the
//! local repository over an RPC port, gates all outbound traffic until the
//! handshake response round-trips, and delivers CRDT sync frames with bounded
//! retry. Space multiplexing is not handled here; see [`crate::replicator`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures_lite::future::Boxed as BoxedFuture;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{
    keys::RepoId,
    metrics::Metrics,
    proto::{Request, Response},
};

/// Bidirectional call/response port the channel runs on.
///
/// Implemented by the transport layer. `call` resolves once the remote peer
/// has acknowledged the request.
pub trait RpcPort: Send + Sync + 'static {
    /// Perform one call on the port.
    fn call(&self, request: Request) -> BoxedFuture<Result<Response, PortError>>;
    /// Close the port gracefully.
    fn close(&self);
    /// Abort the port, dropping in-flight calls.
    fn abort(&self);
}

/// Errors surfaced by an [`RpcPort`].
#[derive(Debug, Clone, Error)]
pub enum PortError {
    /// The underlying channel is closed; the peer is gone.
    #[error("port closed")]
    Closed,
    /// The call failed for any other reason.
    #[error("call failed: {0}")]
    Failed(String),
}

/// Errors surfaced by a [`SyncChannel`].
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The channel was torn down; sends fail fast.
    #[error("sync channel is destroyed")]
    Destroyed,
    /// The replication handshake failed.
    #[error("replication handshake failed: {reason}")]
    Handshake {
        /// Failure reported by the port.
        reason: String,
    },
    /// A send exhausted its retry budget; the channel has been closed.
    #[error("retries exceeded after {attempts} attempts")]
    RetriesExceeded {
        /// Total failed attempts.
        attempts: u32,
    },
}

/// Callbacks into the owner of the channel.
pub trait ChannelEvents: Send + Sync + 'static {
    /// The remote peer announced its repository.
    fn on_remote_start(&self, repo_id: RepoId);
    /// The remote peer sent a sync frame.
    fn on_sync_message(&self, frame: Bytes);
    /// The channel was torn down, with the triggering error if any.
    fn on_closed(&self, error: Option<ChannelError>);
}

/// Retry policy for [`SyncChannel::send_sync_message`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total failed attempts before the channel is forcibly closed.
    pub max_retries: u32,
    /// Number of consecutive failures retried without delay; every multiple
    /// of this count triggers a backoff pause.
    pub retries_before_backoff: u32,
    /// Fixed pause between backoff retries.
    pub retry_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 10,
            retries_before_backoff: 3,
            retry_backoff: Duration::from_millis(1000),
        }
    }
}

/// Retry bookkeeping, stepped by value on each failure.
///
/// Keeping this a plain value makes the policy testable without timers; the
/// async send path only interprets the returned [`RetryStep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far.
    pub failures: u32,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Retry immediately.
    Immediate,
    /// Sleep, then retry.
    Backoff(Duration),
    /// Give up and close the channel.
    Exceeded,
}

impl RetryState {
    /// Record one failure and decide the next step.
    pub fn on_failure(self, policy: &RetryPolicy) -> (RetryState, RetryStep) {
        let failures = self.failures + 1;
        let next = RetryState { failures };
        let step = if failures >= policy.max_retries {
            RetryStep::Exceeded
        } else if policy.retries_before_backoff > 0 && failures % policy.retries_before_backoff == 0
        {
            RetryStep::Backoff(policy.retry_backoff)
        } else {
            RetryStep::Immediate
        };
        (next, step)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Gate {
    Armed,
    Ready,
    Destroyed,
}

/// A reliable sync channel over one peer session.
#[derive(Clone, derive_more::Debug)]
pub struct SyncChannel {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    #[debug("RpcPort")]
    port: Arc<dyn RpcPort>,
    #[debug("ChannelEvents")]
    events: Arc<dyn ChannelEvents>,
    local_repo: RepoId,
    policy: RetryPolicy,
    destroyed: AtomicBool,
    gate_tx: watch::Sender<Gate>,
    metrics: Arc<Metrics>,
}

impl SyncChannel {
    /// Create a channel over `port`.
    ///
    /// The ready gate starts armed: [`Self::send_sync_message`] suspends until
    /// [`Self::start`] has completed the replication handshake.
    pub fn new(
        port: Arc<dyn RpcPort>,
        events: Arc<dyn ChannelEvents>,
        local_repo: RepoId,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (gate_tx, _) = watch::channel(Gate::Armed);
        SyncChannel {
            inner: Arc::new(Inner {
                port,
                events,
                local_repo,
                policy,
                destroyed: AtomicBool::new(false),
                gate_tx,
                metrics,
            }),
        }
    }

    /// Whether the channel has been torn down.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Announce the local repository and open the ready gate.
    ///
    /// Must complete before any [`Self::send_sync_message`] can proceed. A
    /// handshake failure tears the channel down.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.is_destroyed() {
            return Err(ChannelError::Destroyed);
        }
        let request = Request::StartReplication {
            repo_id: self.inner.local_repo,
        };
        match self.inner.port.call(request).await {
            Ok(Response::ReplicationStarted { repo_id }) => {
                trace!(remote = %repo_id, "replication handshake complete");
                self.inner.events.on_remote_start(repo_id);
                self.inner.gate_tx.send_replace(Gate::Ready);
                Ok(())
            }
            Ok(other) => {
                let err = ChannelError::Handshake {
                    reason: format!("unexpected response: {other}"),
                };
                self.teardown(Some(err.clone()), false);
                Err(err)
            }
            Err(cause) => {
                let err = ChannelError::Handshake {
                    reason: cause.to_string(),
                };
                self.teardown(Some(err.clone()), false);
                Err(err)
            }
        }
    }

    /// Send one CRDT sync frame, reliably.
    ///
    /// Suspends until the ready gate opens. A closed port is treated as a
    /// no-op success (the peer is gone, there is nothing to retry). Other
    /// failures are retried per the [`RetryPolicy`]; exhausting the budget
    /// forcibly closes the channel and fails this call with
    /// [`ChannelError::RetriesExceeded`].
    pub async fn send_sync_message(&self, frame: Bytes) -> Result<(), ChannelError> {
        if self.is_destroyed() {
            return Err(ChannelError::Destroyed);
        }
        self.wait_ready().await?;

        let mut state = RetryState::default();
        loop {
            if self.is_destroyed() {
                return Err(ChannelError::Destroyed);
            }
            let request = Request::SyncMessage {
                frame: frame.clone(),
            };
            match self.inner.port.call(request).await {
                Ok(_) => return Ok(()),
                Err(PortError::Closed) => {
                    debug!("sync send on closed channel, dropping");
                    return Ok(());
                }
                Err(PortError::Failed(reason)) => {
                    let (next, step) = state.on_failure(&self.inner.policy);
                    state = next;
                    debug!(failures = state.failures, %reason, "sync send failed");
                    match step {
                        RetryStep::Immediate => {
                            self.inner.metrics.channel_retries.inc();
                        }
                        RetryStep::Backoff(delay) => {
                            self.inner.metrics.channel_retries.inc();
                            tokio::time::sleep(delay).await;
                        }
                        RetryStep::Exceeded => {
                            warn!(attempts = state.failures, "sync send retries exceeded");
                            self.inner.metrics.channel_retry_failures.inc();
                            let err = ChannelError::RetriesExceeded {
                                attempts: state.failures,
                            };
                            self.teardown(Some(err.clone()), false);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Handle an inbound call from the remote peer.
    pub fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::StartReplication { repo_id } => {
                self.inner.events.on_remote_start(repo_id);
                Response::ReplicationStarted {
                    repo_id: self.inner.local_repo,
                }
            }
            Request::SyncMessage { frame } => {
                self.inner.events.on_sync_message(frame);
                Response::Ack
            }
        }
    }

    /// Tear the channel down gracefully. Idempotent.
    pub fn close(&self) {
        self.teardown(None, false);
    }

    /// Tear the channel down, aborting in-flight calls. Idempotent.
    pub fn abort(&self, error: Option<ChannelError>) {
        self.teardown(error, true);
    }

    async fn wait_ready(&self) -> Result<(), ChannelError> {
        let mut rx = self.inner.gate_tx.subscribe();
        let gate = rx
            .wait_for(|gate| *gate != Gate::Armed)
            .await
            .map(|gate| *gate)
            // The sender lives in Inner, which we hold; closed means destroyed.
            .unwrap_or(Gate::Destroyed);
        match gate {
            Gate::Ready => Ok(()),
            _ => Err(ChannelError::Destroyed),
        }
    }

    fn teardown(&self, error: Option<ChannelError>, abort: bool) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(?error, "sync channel teardown");
        // Release gate waiters before the port goes away.
        self.inner.gate_tx.send_replace(Gate::Destroyed);
        if abort {
            self.inner.port.abort();
        } else {
            self.inner.port.close();
        }
        self.inner.events.on_closed(error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, AtomicUsize},
    };

    use rand_chacha::ChaCha12Rng;
    use rand_core::SeedableRng;
    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Ok,
        AlwaysFail,
        Closed,
    }

    struct MockPort {
        mode: Mode,
        calls: Mutex<Vec<Request>>,
        closed: AtomicU32,
        aborted: AtomicU32,
    }

    impl MockPort {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(MockPort {
                mode,
                calls: Mutex::new(vec![]),
                closed: AtomicU32::new(0),
                aborted: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> Vec<Request> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RpcPort for MockPort {
        fn call(&self, request: Request) -> BoxedFuture<Result<Response, PortError>> {
            self.calls.lock().unwrap().push(request.clone());
            let mode = self.mode;
            Box::pin(async move {
                match (mode, request) {
                    (Mode::Closed, _) => Err(PortError::Closed),
                    (Mode::AlwaysFail, Request::SyncMessage { .. }) => {
                        Err(PortError::Failed("boom".to_string()))
                    }
                    (_, Request::StartReplication { repo_id }) => {
                        Ok(Response::ReplicationStarted { repo_id })
                    }
                    (_, Request::SyncMessage { .. }) => Ok(Response::Ack),
                }
            })
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(&self) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        remote_starts: Mutex<Vec<RepoId>>,
        frames: Mutex<Vec<Bytes>>,
        closed: Mutex<Vec<Option<ChannelError>>>,
        closed_count: AtomicUsize,
    }

    impl ChannelEvents for RecordingEvents {
        fn on_remote_start(&self, repo_id: RepoId) {
            self.remote_starts.lock().unwrap().push(repo_id);
        }

        fn on_sync_message(&self, frame: Bytes) {
            self.frames.lock().unwrap().push(frame);
        }

        fn on_closed(&self, error: Option<ChannelError>) {
            self.closed_count.fetch_add(1, Ordering::SeqCst);
            self.closed.lock().unwrap().push(error);
        }
    }

    fn channel(
        mode: Mode,
    ) -> (SyncChannel, Arc<MockPort>, Arc<RecordingEvents>) {
        let mut rng = ChaCha12Rng::seed_from_u64(20);
        let port = MockPort::new(mode);
        let events = Arc::new(RecordingEvents::default());
        let channel = SyncChannel::new(
            port.clone(),
            events.clone(),
            RepoId::random(&mut rng),
            RetryPolicy::default(),
            Arc::new(Metrics::default()),
        );
        (channel, port, events)
    }

    #[test]
    fn retry_state_progression() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        let mut steps = vec![];
        loop {
            let (next, step) = state.on_failure(&policy);
            state = next;
            steps.push(step);
            if step == RetryStep::Exceeded {
                break;
            }
        }
        assert_eq!(state.failures, 10);
        let backoffs: Vec<u32> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, RetryStep::Backoff(_)))
            .map(|(i, _)| i as u32 + 1)
            .collect();
        assert_eq!(backoffs, vec![3, 6, 9]);
        assert_eq!(steps.last(), Some(&RetryStep::Exceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_bound_escalates_to_close() {
        let (channel, port, events) = channel(Mode::AlwaysFail);
        channel.start().await.unwrap();

        let before = Instant::now();
        let res = channel.send_sync_message(Bytes::from_static(b"frame")).await;
        match res {
            Err(ChannelError::RetriesExceeded { attempts }) => assert_eq!(attempts, 10),
            other => panic!("expected RetriesExceeded, got {other:?}"),
        }
        // Backoff slept on the 3rd, 6th and 9th failure.
        assert_eq!(before.elapsed(), Duration::from_millis(3000));

        let sync_calls = port
            .calls()
            .iter()
            .filter(|c| matches!(c, Request::SyncMessage { .. }))
            .count();
        assert_eq!(sync_calls, 10);

        assert!(channel.is_destroyed());
        assert_eq!(events.closed_count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            events.closed.lock().unwrap()[0],
            Some(ChannelError::RetriesExceeded { attempts: 10 })
        ));
        // Subsequent sends fail fast.
        assert!(matches!(
            channel.send_sync_message(Bytes::new()).await,
            Err(ChannelError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn closed_port_send_is_noop() {
        let (channel, port, _events) = channel(Mode::Ok);
        channel.start().await.unwrap();

        let closed_port = MockPort::new(Mode::Closed);
        let closed_channel = SyncChannel::new(
            closed_port.clone(),
            Arc::new(RecordingEvents::default()),
            RepoId::default(),
            RetryPolicy::default(),
            Arc::new(Metrics::default()),
        );
        // Open the gate manually; the handshake would fail on a closed port.
        closed_channel.inner.gate_tx.send_replace(Gate::Ready);

        closed_channel
            .send_sync_message(Bytes::from_static(b"frame"))
            .await
            .unwrap();
        assert_eq!(closed_port.calls().len(), 1);
        assert!(!closed_channel.is_destroyed());

        // A healthy channel sends exactly once.
        channel
            .send_sync_message(Bytes::from_static(b"frame"))
            .await
            .unwrap();
        assert_eq!(port.calls().len(), 2);
    }

    #[tokio::test]
    async fn gate_blocks_sends_until_handshake() {
        let (channel, port, _events) = channel(Mode::Ok);

        let sender = channel.clone();
        let send_task =
            tokio::spawn(async move { sender.send_sync_message(Bytes::from_static(b"x")).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // No sync message can go out before the handshake.
        assert!(port.calls().is_empty());

        channel.start().await.unwrap();
        send_task.await.unwrap().unwrap();

        let calls = port.calls();
        assert!(matches!(calls[0], Request::StartReplication { .. }));
        assert!(matches!(calls[1], Request::SyncMessage { .. }));
    }

    #[tokio::test]
    async fn teardown_releases_gate_waiters() {
        let (channel, _port, events) = channel(Mode::Ok);

        let sender = channel.clone();
        let send_task =
            tokio::spawn(async move { sender.send_sync_message(Bytes::from_static(b"x")).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        channel.close();
        assert!(matches!(
            send_task.await.unwrap(),
            Err(ChannelError::Destroyed)
        ));
        assert_eq!(events.closed_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (channel, port, events) = channel(Mode::Ok);
        channel.close();
        channel.close();
        channel.abort(None);
        assert_eq!(events.closed_count.load(Ordering::SeqCst), 1);
        assert_eq!(port.closed.load(Ordering::SeqCst), 1);
        assert_eq!(port.aborted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inbound_calls_invoke_callbacks() {
        let (channel, _port, events) = channel(Mode::Ok);
        let mut rng = ChaCha12Rng::seed_from_u64(21);
        let remote = RepoId::random(&mut rng);

        let response = channel.handle_request(Request::StartReplication { repo_id: remote });
        assert!(matches!(response, Response::ReplicationStarted { .. }));
        assert_eq!(events.remote_starts.lock().unwrap().as_slice(), &[remote]);

        let response = channel.handle_request(Request::SyncMessage {
            frame: Bytes::from_static(b"frame"),
        });
        assert!(matches!(response, Response::Ack));
        assert_eq!(events.frames.lock().unwrap().len(), 1);
    }
}
