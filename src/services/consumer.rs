use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::services::queue::{Delivery, QueueError, TaskQueue};

/// How a handler settles one delivery. There is no implicit acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done; remove the message for good.
    Ack,
    /// Put it back on the queue tail for another attempt.
    Requeue,
    /// Drop it as poison.
    Discard,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::Discard => "discard",
        }
    }
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Single-slot consumer (prefetch 1) over one or more queues.
///
/// Queues are listed in preference order: a new claim always tries the
/// first queue before the next, so a priority queue listed first wins
/// whenever it has pending work.
pub struct Consumer {
    queue: Arc<dyn TaskQueue>,
    subscriptions: Vec<String>,
    poll_interval: Duration,
    reap_interval: Duration,
}

impl Consumer {
    pub fn new(queue: Arc<dyn TaskQueue>, subscriptions: Vec<String>, poll_interval: Duration) -> Self {
        Self {
            queue,
            subscriptions,
            poll_interval,
            reap_interval: Duration::from_secs(30),
        }
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    /// Claim from the most preferred queue that has work.
    pub async fn next_delivery(&self) -> Result<Option<Delivery>, QueueError> {
        for queue in &self.subscriptions {
            if let Some(delivery) = self.queue.claim(queue).await? {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    /// Claim, handle and settle one delivery. Returns `Ok(false)` when every
    /// subscribed queue was empty.
    pub async fn process_one<H>(&self, handler: &H) -> Result<bool, QueueError>
    where
        H: DeliveryHandler + ?Sized,
    {
        let delivery = match self.next_delivery().await? {
            Some(delivery) => delivery,
            None => return Ok(false),
        };

        let disposition = handler.handle(&delivery).await;
        metrics::counter!("analysis_deliveries_total", "outcome" => disposition.as_str()).increment(1);

        let settled = match disposition {
            Disposition::Ack => self.queue.ack(&delivery).await,
            Disposition::Requeue => self.queue.reject(&delivery, true).await,
            Disposition::Discard => self.queue.reject(&delivery, false).await,
        };
        match settled {
            Ok(()) => {
                tracing::debug!(queue = %delivery.queue, outcome = disposition.as_str(), "Delivery settled");
            }
            // lease ran out mid-handling; the reaper already put it back
            Err(QueueError::UnknownDelivery(_)) => {
                tracing::warn!(
                    queue = %delivery.queue,
                    attempt = delivery.attempt,
                    outcome = disposition.as_str(),
                    "Delivery already settled or reclaimed"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    /// Return expired claims on every subscribed queue.
    pub async fn reap(&self) -> Result<usize, QueueError> {
        let mut returned = 0;
        for queue in &self.subscriptions {
            returned += self.queue.requeue_expired(queue).await?;
        }
        if returned > 0 {
            tracing::info!(returned, "Returned expired deliveries to their queues");
        }
        Ok(returned)
    }

    /// Consume until `shutdown` flips to `true`. Shutdown is only observed
    /// between deliveries.
    pub async fn run<H>(&self, handler: &H, mut shutdown: watch::Receiver<bool>)
    where
        H: DeliveryHandler + ?Sized,
    {
        tracing::info!(queues = ?self.subscriptions, "Consumer started");
        let mut last_reap: Option<Instant> = None;

        while !*shutdown.borrow() {
            if last_reap.map_or(true, |at| at.elapsed() >= self.reap_interval) {
                if let Err(e) = self.reap().await {
                    tracing::error!(error = %e, "Failed to return expired deliveries");
                }
                last_reap = Some(Instant::now());
            }

            let idle = match self.process_one(handler).await {
                Ok(true) => {
                    tracing::debug!("Delivery processed, checking for next");
                    false
                }
                Ok(false) => {
                    tracing::trace!("No deliveries available, sleeping");
                    true
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queue error, will retry");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("Consumer stopped");
    }
}
