use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::source::{EventSource, EventSourceFactory, MessagePosition, RawMessage};
use crate::errors::SourceError;

/// Channel-backed source that records every commit.
pub struct MemorySource {
    topic: String,
    sender: mpsc::UnboundedSender<Result<RawMessage, SourceError>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<RawMessage, SourceError>>>,
    next_offset: Mutex<i64>,
    commits: Mutex<Vec<MessagePosition>>,
}

impl MemorySource {
    pub fn new(topic: &str) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            topic: topic.to_string(),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            next_offset: Mutex::new(0),
            commits: Mutex::new(Vec::new()),
        })
    }

    /// Append a record to partition 0 and return its position.
    pub fn push(&self, payload: &[u8]) -> MessagePosition {
        let mut next = self.next_offset.lock().unwrap();
        let position = MessagePosition {
            topic: self.topic.clone(),
            partition: 0,
            offset: *next,
        };
        *next += 1;

        let message = RawMessage {
            position: position.clone(),
            key: None,
            payload: Some(payload.to_vec()),
            timestamp: None,
        };
        let _ = self.sender.send(Ok(message));
        position
    }

    pub fn push_json(&self, value: serde_json::Value) -> MessagePosition {
        self.push(value.to_string().as_bytes())
    }

    pub fn push_error(&self, error: SourceError) {
        let _ = self.sender.send(Err(error));
    }

    pub fn commits(&self) -> Vec<MessagePosition> {
        self.commits.lock().unwrap().clone()
    }

    /// Highest committed offset, if any.
    pub fn committed_offset(&self) -> Option<i64> {
        self.commits.lock().unwrap().last().map(|p| p.offset)
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next_message(&self) -> Result<RawMessage, SourceError> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(result) => result,
            None => Err(SourceError::Closed),
        }
    }

    fn commit(&self, position: &MessagePosition) -> Result<(), SourceError> {
        self.commits.lock().unwrap().push(position.clone());
        Ok(())
    }
}

/// Hands out the same source on every subscribe.
pub struct MemorySourceFactory {
    source: Arc<MemorySource>,
}

impl MemorySourceFactory {
    pub fn new(source: Arc<MemorySource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl EventSourceFactory for MemorySourceFactory {
    async fn subscribe(&self, _topic: &str) -> Result<Arc<dyn EventSource>, SourceError> {
        Ok(self.source.clone())
    }
}
