//! In-process broker with the same list semantics as the redis one.
//!
//! Used by tests and local runs that have no redis at hand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::queue::{Broker, QueueError};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    published: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a list, left to right.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.lists()
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.lists().get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.inner.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self, queue: &str, processing: &str) -> Option<String> {
        let mut lists = self.lists();
        let payload = lists.get_mut(queue)?.pop_back()?;
        lists
            .entry(processing.to_string())
            .or_default()
            .push_front(payload.clone());
        Some(payload)
    }
}

fn remove_first(lists: &mut HashMap<String, VecDeque<String>>, key: &str, payload: &str) {
    if let Some(list) = lists.get_mut(key) {
        if let Some(position) = list.iter().position(|item| item == payload) {
            list.remove(position);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        self.lists()
            .entry(queue.to_string())
            .or_default()
            .push_front(payload.to_string());
        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        processing: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let published = self.inner.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            if let Some(payload) = self.try_claim(queue, processing) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn settle(&self, processing: &str, payload: &str) -> Result<(), QueueError> {
        remove_first(&mut self.lists(), processing, payload);
        Ok(())
    }

    async fn restore(
        &self,
        queue: &str,
        processing: &str,
        payload: &str,
    ) -> Result<(), QueueError> {
        {
            let mut lists = self.lists();
            remove_first(&mut lists, processing, payload);
            lists
                .entry(queue.to_string())
                .or_default()
                .push_back(payload.to_string());
        }
        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn bury(
        &self,
        dead_letter: &str,
        processing: &str,
        payload: &str,
    ) -> Result<(), QueueError> {
        let mut lists = self.lists();
        remove_first(&mut lists, processing, payload);
        lists
            .entry(dead_letter.to_string())
            .or_default()
            .push_front(payload.to_string());
        Ok(())
    }
}
