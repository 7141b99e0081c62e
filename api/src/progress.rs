/// Real-time progress notification channel.
///
/// Holds at most one live subscriber. Producers anywhere in the backend call
/// [`ProgressChannel::publish`]; events are written to the subscriber if one
/// is connected and dropped otherwise. Subscriber loss never reaches the
/// producer.
use std::future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vidrelay_shared::errors::ChannelError;
use vidrelay_shared::models::ProgressEvent;

use crate::reply::Failure;
use crate::AppState;

/// How long one frame may take to reach a subscriber before it is dropped.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of a subscriber connection, taking text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = axum::Error> + Send>>;

struct Subscriber {
    id: u64,
    sink: FrameSink,
    evicted: CancellationToken,
}

/// Handle kept by the task that owns a subscriber's read half.
pub struct Subscription {
    id: u64,
    evicted: CancellationToken,
}

impl Subscription {
    /// True once the subscriber was replaced or dropped after a failed write.
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }
}

/// Single-subscriber progress channel.
///
/// Every state transition (attach, publish, detach) happens under one lock.
/// A write holds the lock for at most `write_timeout`.
pub struct ProgressChannel {
    slot: Mutex<Option<Subscriber>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(0),
            write_timeout,
        }
    }

    /// Install a new subscriber, abruptly dropping the prior one if any.
    pub async fn attach(&self, sink: FrameSink) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let evicted = CancellationToken::new();

        let mut slot = self.slot.lock().await;
        if let Some(prior) = slot.take() {
            // No close frame: dropping the sink and waking the reader tears
            // the old connection down.
            prior.evicted.cancel();
            info!("Progress subscriber #{} replaced by #{}", prior.id, id);
        }
        *slot = Some(Subscriber {
            id,
            sink,
            evicted: evicted.clone(),
        });

        Subscription { id, evicted }
    }

    /// Clear the slot if it still belongs to `subscription`.
    ///
    /// Returns false when the subscriber was already replaced or cleared.
    pub async fn detach(&self, subscription: &Subscription) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(current) if current.id == subscription.id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Best-effort publish. Never fails and never queues.
    ///
    /// A subscriber whose write fails or stalls past the write timeout is
    /// dropped as if it had disconnected.
    pub async fn publish(&self, event: &ProgressEvent) {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unserializable progress event: {}", e);
                return;
            }
        };

        let mut slot = self.slot.lock().await;
        let Some(subscriber) = slot.as_mut() else {
            return;
        };

        match tokio::time::timeout(self.write_timeout, subscriber.sink.send(frame)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                warn!("Error sending progress to subscriber #{}: {}", subscriber.id, e);
            }
            Err(_) => {
                warn!(
                    "Progress subscriber #{} not reading for {:?}, dropping it",
                    subscriber.id, self.write_timeout
                );
            }
        }
        if let Some(gone) = slot.take() {
            gone.evicted.cancel();
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Attach `sink` and hold the connection until the peer goes away or the
    /// subscriber is evicted. Inbound frames only prove liveness and are
    /// discarded.
    pub async fn serve<S>(&self, sink: FrameSink, mut inbound: S)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let subscription = self.attach(sink).await;
        info!("Frontend connected to progress channel (subscriber #{})", subscription.id);

        loop {
            tokio::select! {
                _ = subscription.evicted.cancelled() => {
                    debug!("Subscriber #{} evicted", subscription.id);
                    break;
                }
                frame = inbound.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Progress subscriber #{} disconnected", subscription.id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        info!("Progress subscriber #{} disconnected: {}", subscription.id, e);
                        break;
                    }
                },
            }
        }

        self.detach(&subscription).await;
    }
}

/// GET /progress - upgrade to the progress WebSocket.
pub async fn progress_ws(
    State(state): State<Arc<AppState>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = ChannelError::Transport(rejection.body_text());
            warn!("Failed to upgrade to WebSocket: {}", err);
            return Failure::from(err).into_response();
        }
    };

    let channel = state.progress.clone();
    ws.on_failed_upgrade(|e| warn!("Failed to upgrade to WebSocket: {}", e))
        .on_upgrade(move |socket| async move {
            let (tx, rx) = socket.split();
            let sink: FrameSink = Box::pin(
                tx.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text)))),
            );
            channel.serve(sink, rx).await;
        })
}
