//! Out-of-band completion replies.
//!
//! Applied actions push a [`Reply`] onto the [`Outbox`]; a dispatcher task
//! hands each one to the [`ReplySink`] exactly once. Delivery failures are
//! logged and dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ca: String,
    pub method: String,
    pub request_id: Uuid,
    pub error: Option<String>,
    pub data: Value,
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, reply: Reply) -> Result<(), String>;
}

/// Sending half of the reply channel.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Reply>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, reply: Reply) {
        if let Err(e) = self.tx.send(reply) {
            warn!(request_id = %e.0.request_id, ca = %e.0.ca, "reply dispatcher gone, dropping reply");
        }
    }
}

/// Drain `rx` into `sink` until every [`Outbox`] is dropped.
pub fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Reply>,
    sink: Arc<dyn ReplySink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let request_id = reply.request_id;
            let ca = reply.ca.clone();
            match sink.deliver(reply).await {
                Ok(()) => debug!(%ca, %request_id, "reply delivered"),
                Err(e) => warn!(%ca, %request_id, error = %e, "reply delivery failed"),
            }
        }
        debug!("reply dispatcher stopped");
    })
}

/// Replies a CA may leave undrained before the oldest are dropped.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Keeps replies per CA until they are drained.
///
/// Each mailbox holds at most `capacity` replies; a full mailbox drops its
/// oldest reply to make room.
#[derive(Clone)]
pub struct Mailboxes {
    inner: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
    capacity: usize,
}

impl Default for Mailboxes {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    pub fn drain(&self, ca: &str) -> Vec<Reply> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ca)
            .map(Vec::from)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReplySink for Mailboxes {
    async fn deliver(&self, reply: Reply) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mailbox = inner.entry(reply.ca.clone()).or_default();
        if mailbox.len() >= self.capacity {
            let dropped = mailbox.pop_front().map(|r| r.request_id);
            warn!(ca = %reply.ca, ?dropped, "mailbox full, dropping oldest reply");
        }
        mailbox.push_back(reply);
        Ok(())
    }
}
