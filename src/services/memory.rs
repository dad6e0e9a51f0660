//! In-process queue and result store.
//!
//! Same semantics as the Redis implementations, used by tests and for
//! running the pipeline without infrastructure.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::analysis::AnalysisResult;
use crate::models::task::TaskMessage;
use crate::services::queue::{
    Delivery, DeliveryMode, Envelope, PublishError, QueueDefinition, QueueError, TaskQueue,
};
use crate::services::results::{ResultStore, StoreError};

#[derive(Default)]
struct QueueState {
    definition: Option<QueueDefinition>,
    ready: VecDeque<String>,
    in_flight: Vec<(String, Instant)>,
    dead: Vec<String>,
}

pub struct MemoryTaskQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    visibility_timeout: Duration,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout,
        }
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f(queues.entry(queue.to_string()).or_default())
    }

    /// Messages discarded as poison.
    pub fn dead_letters(&self, queue: &str) -> Vec<String> {
        self.with_queue(queue, |state| state.dead.clone())
    }

    /// Claimed but not yet settled messages.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.with_queue(queue, |state| state.in_flight.len())
    }

    /// Bodies waiting to be claimed, head first.
    pub fn pending_bodies(&self, queue: &str) -> Vec<String> {
        self.with_queue(queue, |state| {
            state
                .ready
                .iter()
                .map(|raw| Envelope::from_wire(raw).body)
                .collect()
        })
    }

    /// Push a raw message as a foreign producer would.
    pub fn push_raw(&self, queue: &str, raw: &str) {
        self.with_queue(queue, |state| state.ready.push_back(raw.to_string()));
    }

    fn take_in_flight(state: &mut QueueState, delivery: &Delivery) -> Result<(), QueueError> {
        let position = state
            .in_flight
            .iter()
            .position(|(tag, _)| *tag == delivery.tag)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.queue.clone()))?;
        state.in_flight.remove(position);
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn declare(&self, definition: &QueueDefinition) -> Result<(), QueueError> {
        self.with_queue(&definition.name, |state| {
            if let Some(existing) = &state.definition {
                if existing != definition {
                    return Err(QueueError::IncompatibleDeclaration {
                        queue: definition.name.clone(),
                        existing: existing.clone(),
                    });
                }
                return Ok(());
            }
            state.definition = Some(definition.clone());
            Ok(())
        })
    }

    async fn publish(
        &self,
        queue: &str,
        task: &TaskMessage,
        mode: DeliveryMode,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_string(task).map_err(QueueError::Serialize)?;
        let raw = Envelope::new(body, mode)
            .to_wire()
            .map_err(QueueError::Serialize)?;
        self.with_queue(queue, |state| state.ready.push_back(raw));
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + self.visibility_timeout;
        let raw = self.with_queue(queue, |state| {
            let raw = state.ready.pop_front()?;
            state.in_flight.push((raw.clone(), deadline));
            Some(raw)
        });
        Ok(raw.map(|raw| Delivery::from_wire(queue, raw)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.with_queue(&delivery.queue, |state| Self::take_in_flight(state, delivery))
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let redelivery = Envelope::from_wire(&delivery.tag).redelivery().to_wire()?;
        self.with_queue(&delivery.queue, |state| {
            Self::take_in_flight(state, delivery)?;
            if requeue {
                state.ready.push_back(redelivery);
            } else {
                state.dead.push(delivery.tag.clone());
            }
            Ok(())
        })
    }

    async fn requeue_expired(&self, queue: &str) -> Result<usize, QueueError> {
        let now = Instant::now();
        let expired: Vec<String> = self.with_queue(queue, |state| {
            let (expired, live): (Vec<_>, Vec<_>) = state
                .in_flight
                .drain(..)
                .partition(|(_, deadline)| *deadline <= now);
            state.in_flight = live;
            expired.into_iter().map(|(tag, _)| tag).collect()
        });

        let count = expired.len();
        for tag in expired {
            let redelivery = Envelope::from_wire(&tag).redelivery().to_wire()?;
            self.with_queue(queue, |state| state.ready.push_back(redelivery));
        }
        Ok(count)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.with_queue(queue, |state| state.ready.len() as u64))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// In-process result store honoring per-entry expiry.
#[derive(Default)]
pub struct MemoryResultStore {
    entries: Mutex<HashMap<String, (AnalysisResult, Instant)>>,
    failing_puts: Mutex<usize>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail as if the cache were unreachable.
    pub fn fail_next_puts(&self, count: usize) {
        *self.failing_puts.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(
        &self,
        task_id: &str,
        result: &AnalysisResult,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        {
            let mut failing = self.failing_puts.lock().unwrap_or_else(|e| e.into_inner());
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::Unavailable("injected write failure".to_string()));
            }
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), (result.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<AnalysisResult>, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(task_id) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(task_id);
                Ok(None)
            }
            Some((result, _)) => Ok(Some(result.clone())),
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
