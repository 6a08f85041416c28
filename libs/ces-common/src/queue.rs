/// Reliable work queue on top of a list-based broker
///
/// **Delivery contract:**
/// - A claimed message is parked in a per-consumer processing list until it
///   is acknowledged or rejected, so a crashed worker never silently drops it
/// - At most `prefetch` messages are unacknowledged at any time
/// - Every delivery gets a tag that can be settled exactly once
///
/// The broker itself only knows lists; the bookkeeping lives here so the
/// redis and in-memory brokers behave identically.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::redis::{dead_letter_key, processing_key, queue_key};

/// How long a single claim blocks before the pump re-checks its state
const CLAIM_TIMEOUT: Duration = Duration::from_secs(1);

/// Back-off after a failed claim
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("delivery {0} is not outstanding")]
    UnknownDelivery(DeliveryId),
    #[error("queue consumer is closed")]
    Closed,
}

/// List primitives a broker must provide.
///
/// Lists are pushed on the left and claimed from the right. Every method
/// that touches two lists must do so atomically.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Push a payload onto the left of `queue`.
    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError>;

    /// Move the rightmost payload of `queue` into `processing`, waiting up to
    /// `timeout` for one to appear.
    async fn claim(
        &self,
        queue: &str,
        processing: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Drop a payload from `processing`.
    async fn settle(&self, processing: &str, payload: &str) -> Result<(), QueueError>;

    /// Move a payload from `processing` back to the right of `queue`, making
    /// it the next one claimed.
    async fn restore(&self, queue: &str, processing: &str, payload: &str)
        -> Result<(), QueueError>;

    /// Move a payload from `processing` onto the left of `dead_letter`.
    async fn bury(&self, dead_letter: &str, processing: &str, payload: &str)
        -> Result<(), QueueError>;
}

/// Opaque handle of one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryId(u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub delivery_id: DeliveryId,
    pub content: String,
}

#[async_trait]
pub trait ReceiveQueue: Send + Sync {
    /// Wait for the next delivery.
    async fn receive(&self) -> Result<ReceivedMessage, QueueError>;

    async fn acknowledge(&self, delivery_id: DeliveryId) -> Result<(), QueueError>;

    async fn reject(&self, delivery_id: DeliveryId, requeue: bool) -> Result<(), QueueError>;
}

#[async_trait]
pub trait SendQueue: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), QueueError>;
}

struct InFlight {
    payload: String,
    _permit: OwnedSemaphorePermit,
}

struct Shared<B> {
    broker: Arc<B>,
    queue: String,
    processing: String,
    dead_letter: String,
    in_flight: Mutex<HashMap<u64, InFlight>>,
}

impl<B> Shared<B> {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<u64, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer side of a named queue.
///
/// A background pump claims messages while the prefetch window has room and
/// hands them to [`ReceiveQueue::receive`] through a bounded buffer.
pub struct ReliableQueue<B: Broker> {
    shared: Arc<Shared<B>>,
    deliveries: tokio::sync::Mutex<mpsc::Receiver<ReceivedMessage>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Broker> ReliableQueue<B> {
    /// Start consuming `name` with at most `prefetch` unacknowledged messages.
    pub fn consume(broker: Arc<B>, name: &str, prefetch: usize) -> Self {
        let prefetch = prefetch.max(1);
        let shared = Arc::new(Shared {
            broker,
            queue: queue_key(name),
            processing: processing_key(name, &Uuid::new_v4()),
            dead_letter: dead_letter_key(name),
            in_flight: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::channel(prefetch);
        let window = Arc::new(Semaphore::new(prefetch));
        let pump = tokio::spawn(pump(shared.clone(), window, tx));

        debug!(
            queue = %shared.queue,
            processing = %shared.processing,
            prefetch,
            "Consumer started"
        );

        Self {
            shared,
            deliveries: tokio::sync::Mutex::new(rx),
            pump: Mutex::new(Some(pump)),
        }
    }

    pub fn queue_key(&self) -> &str {
        &self.shared.queue
    }

    pub fn processing_key(&self) -> &str {
        &self.shared.processing
    }

    pub fn dead_letter_key(&self) -> &str {
        &self.shared.dead_letter
    }

    /// Stop claiming and hand buffered, never-received messages back to the
    /// queue. Messages already received stay in the processing list until
    /// they are settled.
    pub async fn close(&self) -> Result<(), QueueError> {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        let mut deliveries = self.deliveries.lock().await;
        deliveries.close();

        let mut restored = 0;
        while let Ok(message) = deliveries.try_recv() {
            let entry = self.shared.in_flight().remove(&message.delivery_id.0);
            if let Some(entry) = entry {
                self.shared
                    .broker
                    .restore(&self.shared.queue, &self.shared.processing, &entry.payload)
                    .await?;
                restored += 1;
            }
        }

        let outstanding = self.shared.in_flight().len();
        if outstanding > 0 {
            warn!(
                queue = %self.shared.queue,
                outstanding,
                "Consumer closed with unsettled deliveries"
            );
        }
        debug!(queue = %self.shared.queue, restored, "Consumer closed");
        Ok(())
    }

    fn take(&self, delivery_id: DeliveryId) -> Result<InFlight, QueueError> {
        self.shared
            .in_flight()
            .remove(&delivery_id.0)
            .ok_or(QueueError::UnknownDelivery(delivery_id))
    }
}

impl<B: Broker> Drop for ReliableQueue<B> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl<B: Broker> ReceiveQueue for ReliableQueue<B> {
    async fn receive(&self) -> Result<ReceivedMessage, QueueError> {
        let mut deliveries = self.deliveries.lock().await;
        deliveries.recv().await.ok_or(QueueError::Closed)
    }

    async fn acknowledge(&self, delivery_id: DeliveryId) -> Result<(), QueueError> {
        let entry = self.take(delivery_id)?;
        self.shared
            .broker
            .settle(&self.shared.processing, &entry.payload)
            .await?;
        debug!(queue = %self.shared.queue, %delivery_id, "Delivery acknowledged");
        Ok(())
    }

    async fn reject(&self, delivery_id: DeliveryId, requeue: bool) -> Result<(), QueueError> {
        let entry = self.take(delivery_id)?;
        if requeue {
            self.shared
                .broker
                .restore(&self.shared.queue, &self.shared.processing, &entry.payload)
                .await?;
        } else {
            self.shared
                .broker
                .bury(&self.shared.dead_letter, &self.shared.processing, &entry.payload)
                .await?;
        }
        debug!(queue = %self.shared.queue, %delivery_id, requeue, "Delivery rejected");
        Ok(())
    }
}

async fn pump<B: Broker>(
    shared: Arc<Shared<B>>,
    window: Arc<Semaphore>,
    tx: mpsc::Sender<ReceivedMessage>,
) {
    let mut next_tag: u64 = 0;

    loop {
        let Ok(permit) = window.clone().acquire_owned().await else {
            return;
        };
        // Reserve the buffer slot first so a claimed payload is never held
        // outside both the buffer and the in-flight table.
        let Ok(slot) = tx.reserve().await else {
            return;
        };

        let payload = loop {
            match shared
                .broker
                .claim(&shared.queue, &shared.processing, CLAIM_TIMEOUT)
                .await
            {
                Ok(Some(payload)) => break payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(queue = %shared.queue, error = %e, "Failed to claim message");
                    tokio::time::sleep(CLAIM_RETRY_DELAY).await;
                }
            }
        };

        next_tag += 1;
        let delivery_id = DeliveryId(next_tag);
        shared.in_flight().insert(
            next_tag,
            InFlight {
                payload: payload.clone(),
                _permit: permit,
            },
        );
        slot.send(ReceivedMessage {
            delivery_id,
            content: payload,
        });
    }
}

/// Producer side of a named queue.
pub struct Publisher<B: Broker> {
    broker: Arc<B>,
    queue: String,
}

impl<B: Broker> Publisher<B> {
    pub fn new(broker: Arc<B>, name: &str) -> Self {
        Self {
            broker,
            queue: queue_key(name),
        }
    }
}

#[async_trait]
impl<B: Broker> SendQueue for Publisher<B> {
    async fn send(&self, message: &str) -> Result<(), QueueError> {
        self.broker.publish(&self.queue, message).await?;
        debug!(queue = %self.queue, "Message published");
        Ok(())
    }
}
