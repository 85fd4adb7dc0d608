//! Cancellation bus.
//!
//! Local layer: a registry from job id to the cancel token of the task running it.
//! Distributed layer: every cancellation is also published as the bare job id on a
//! shared channel; each instance listens and cancels the job if it runs it locally.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// In-flight jobs on this instance and the means to interrupt each of them.
///
/// Entries are created by [`CancellationRegistry::register`] and removed when the
/// returned [`Registration`] is dropped, on every exit path of the job task.
#[derive(Debug, Clone)]
pub struct CancellationRegistry {
    entries: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl CancellationRegistry {
    /// Job tokens are children of `shutdown`, never of a request's lifetime.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    pub fn register(&self, job_id: Uuid) -> Registration {
        let token = self.shutdown.child_token();
        self.entries.insert(job_id, token.clone());
        Registration {
            job_id,
            token,
            entries: Arc::clone(&self.entries),
        }
    }

    /// Signal the local task running `job_id`. Returns false if it does not run here.
    pub fn cancel_local(&self, job_id: Uuid) -> bool {
        match self.entries.get(&job_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.entries.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Registry entry guard for one running job.
#[derive(Debug)]
pub struct Registration {
    job_id: Uuid,
    token: CancellationToken,
    entries: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.entries.remove(&self.job_id);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cancellation channel closed")]
    Closed,
}

/// Cross-instance broadcast of cancelled job ids.
///
/// Delivery is at-most-once and best effort; cancellation is idempotent.
#[async_trait]
pub trait CancelChannel: Send + Sync {
    async fn publish(&self, job_id: Uuid) -> Result<(), BusError>;

    /// Open a subscription yielding raw message payloads. The stream ends when the
    /// underlying connection drops.
    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError>;
}

/// Redis pub/sub backed [`CancelChannel`].
pub struct RedisCancelChannel {
    client: redis::Client,
    channel: String,
}

impl RedisCancelChannel {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl CancelChannel for RedisCancelChannel {
    async fn publish(&self, job_id: Uuid) -> Result<(), BusError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(&self.channel, job_id.to_string())
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let messages = pubsub
            .into_on_message()
            .filter_map(|msg| futures::future::ready(msg.get_payload::<String>().ok()));
        Ok(messages.boxed())
    }
}

/// In-process [`CancelChannel`] shared by every orchestrator holding a clone.
#[derive(Debug, Clone)]
pub struct LocalCancelChannel {
    tx: broadcast::Sender<String>,
}

impl LocalCancelChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl Default for LocalCancelChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CancelChannel for LocalCancelChannel {
    async fn publish(&self, job_id: Uuid) -> Result<(), BusError> {
        // No subscribers is not an error: nobody runs the job.
        let _ = self.tx.send(job_id.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError> {
        let rx = self.tx.subscribe();
        let messages = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Cancellation listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}

/// Exponential reconnect delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY)
    }
}

fn handle_message(registry: &CancellationRegistry, payload: &str) {
    metrics::counter!("cancellation_messages_received_total").increment(1);
    match payload.trim().parse::<Uuid>() {
        Ok(job_id) => {
            if registry.cancel_local(job_id) {
                tracing::info!(job_id = %job_id, "Cancelled job from broadcast");
            } else {
                tracing::trace!(job_id = %job_id, "Cancellation for job not running here");
            }
        }
        Err(_) => tracing::warn!(payload, "Ignoring malformed cancellation message"),
    }
}

/// Listen for broadcast cancellations until `shutdown` fires, reconnecting with
/// exponential backoff whenever the subscription fails or ends.
pub async fn run_listener(
    channel: Arc<dyn CancelChannel>,
    registry: CancellationRegistry,
    shutdown: CancellationToken,
    mut backoff: Backoff,
) {
    loop {
        let subscription = tokio::select! {
            _ = shutdown.cancelled() => return,
            s = channel.subscribe() => s,
        };

        match subscription {
            Ok(mut messages) => {
                backoff.reset();
                tracing::info!("Subscribed to cancellation channel");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        msg = messages.next() => match msg {
                            Some(payload) => handle_message(&registry, &payload),
                            None => {
                                tracing::warn!("Cancellation subscription ended, reconnecting");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to subscribe to cancellation channel"),
        }

        let delay = backoff.next_delay();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before resubscribing");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registration_is_removed_on_drop() {
        let registry = CancellationRegistry::new(CancellationToken::new());
        let job_id = Uuid::new_v4();
        let registration = registry.register(job_id);
        assert!(registry.contains(job_id));
        assert_eq!(registration.job_id(), job_id);

        drop(registration);
        assert!(registry.is_empty());
        assert!(!registry.cancel_local(job_id));
    }

    #[test]
    fn cancel_local_signals_token() {
        let registry = CancellationRegistry::new(CancellationToken::new());
        let job_id = Uuid::new_v4();
        let registration = registry.register(job_id);
        assert!(registry.cancel_local(job_id));
        assert!(registration.token().is_cancelled());
    }

    #[test]
    fn shutdown_cancels_every_job() {
        let shutdown = CancellationToken::new();
        let registry = CancellationRegistry::new(shutdown.clone());
        let a = registry.register(Uuid::new_v4());
        let b = registry.register(Uuid::new_v4());
        shutdown.cancel();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn listener_cancels_local_job_from_broadcast() {
        let shutdown = CancellationToken::new();
        let registry = CancellationRegistry::new(shutdown.clone());
        let channel = LocalCancelChannel::new();
        let listener = tokio::spawn(run_listener(
            Arc::new(channel.clone()),
            registry.clone(),
            shutdown.clone(),
            Backoff::default(),
        ));

        let job_id = Uuid::new_v4();
        let registration = registry.register(job_id);

        // The listener subscribes asynchronously; publish until it is observed.
        let observed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                channel.publish(job_id).await.unwrap();
                if registration.token().is_cancelled() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(observed.is_ok());

        shutdown.cancel();
        listener.await.unwrap();
    }

    /// Fails the first subscription attempts, then yields one message.
    struct FlakyChannel {
        attempts: AtomicUsize,
        job_id: Uuid,
    }

    #[async_trait]
    impl CancelChannel for FlakyChannel {
        async fn publish(&self, _job_id: Uuid) -> Result<(), BusError> {
            Ok(())
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(BusError::Closed);
            }
            let payload = self.job_id.to_string();
            Ok(futures::stream::iter(vec![payload])
                .chain(futures::stream::pending())
                .boxed())
        }
    }

    #[tokio::test]
    async fn listener_reconnects_after_failures() {
        let shutdown = CancellationToken::new();
        let registry = CancellationRegistry::new(shutdown.clone());
        let job_id = Uuid::new_v4();
        let registration = registry.register(job_id);
        let channel = Arc::new(FlakyChannel {
            attempts: AtomicUsize::new(0),
            job_id,
        });

        let listener = tokio::spawn(run_listener(
            channel.clone(),
            registry.clone(),
            shutdown.clone(),
            Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        ));

        tokio::time::timeout(Duration::from_secs(2), registration.token().cancelled())
            .await
            .expect("job should be cancelled after reconnect");
        assert!(channel.attempts.load(Ordering::SeqCst) >= 3);

        shutdown.cancel();
        listener.await.unwrap();
    }
}
