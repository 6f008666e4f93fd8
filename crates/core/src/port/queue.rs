// Queue Transport Port
//
// Durable point-to-point delivery of job messages with explicit
// acknowledgement. `QueueChannel`/`QueueConnector` describe one live broker
// connection; `QueueTransport` is what the publisher and dispatcher use, and is
// implemented by `application::transport::ReconnectingTransport`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::JobMessage;

/// Opaque handle identifying one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub String);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received message awaiting acknowledge or requeue
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Reconnect failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl TransportError {
    /// Errors that a fresh connection may cure
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_) | TransportError::Connect(_)
        )
    }
}

/// At-least-once job message transport
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, message: &JobMessage) -> Result<(), TransportError>;

    /// Next available message, `None` when the queue is empty
    async fn receive(&self) -> Result<Option<Delivery>, TransportError>;

    /// Permanently remove a delivered message
    async fn acknowledge(&self, tag: &DeliveryTag) -> Result<(), TransportError>;

    /// Return a delivered message to the queue for any consumer
    async fn requeue(&self, tag: &DeliveryTag) -> Result<(), TransportError>;
}

/// One live broker connection
#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// (Re-)assert queues and bindings; must be idempotent
    async fn declare_topology(&self) -> Result<(), TransportError>;

    async fn publish(&self, body: &[u8]) -> Result<(), TransportError>;

    /// Polling get without auto-ack
    async fn get(&self) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), TransportError>;

    async fn nack_requeue(&self, tag: &DeliveryTag) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn QueueChannel>, TransportError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct BrokerState {
        ready: VecDeque<(Vec<u8>, bool)>,
        unacked: HashMap<DeliveryTag, Vec<u8>>,
        acked: Vec<Vec<u8>>,
        requeued: usize,
        generation: u64,
    }

    /// In-memory broker with fault injection.
    ///
    /// `sever()` drops every open channel the way a broker restart would:
    /// unacknowledged messages go back to the queue flagged as redelivered.
    #[derive(Default)]
    pub struct InMemoryBroker {
        state: Mutex<BrokerState>,
        next_tag: AtomicU64,
        refused_connects: AtomicUsize,
        connects: AtomicUsize,
        declarations: AtomicUsize,
    }

    impl InMemoryBroker {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push_raw(&self, body: impl Into<Vec<u8>>) {
            self.state
                .lock()
                .unwrap()
                .ready
                .push_back((body.into(), false));
        }

        pub fn sever(&self) {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            let unacked: Vec<Vec<u8>> = state.unacked.drain().map(|(_, body)| body).collect();
            for body in unacked {
                state.ready.push_back((body, true));
            }
        }

        /// Fail the next `n` connection attempts
        pub fn refuse_connects(&self, n: usize) {
            self.refused_connects.store(n, Ordering::SeqCst);
        }

        pub fn ready_len(&self) -> usize {
            self.state.lock().unwrap().ready.len()
        }

        pub fn unacked_len(&self) -> usize {
            self.state.lock().unwrap().unacked.len()
        }

        pub fn acked(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().acked.clone()
        }

        pub fn requeued(&self) -> usize {
            self.state.lock().unwrap().requeued
        }

        pub fn ready_bodies(&self) -> Vec<Vec<u8>> {
            let state = self.state.lock().unwrap();
            state.ready.iter().map(|(body, _)| body.clone()).collect()
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn declarations(&self) -> usize {
            self.declarations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueueConnector for Arc<InMemoryBroker> {
        async fn connect(&self) -> Result<Arc<dyn QueueChannel>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self
                .refused_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            let generation = self.state.lock().unwrap().generation;
            Ok(Arc::new(InMemoryChannel {
                broker: Arc::clone(self),
                generation,
            }))
        }
    }

    pub struct InMemoryChannel {
        broker: Arc<InMemoryBroker>,
        generation: u64,
    }

    impl InMemoryChannel {
        fn check_open(&self) -> Result<(), TransportError> {
            if self.is_open() {
                Ok(())
            } else {
                Err(TransportError::ConnectionLost("channel closed".to_string()))
            }
        }
    }

    #[async_trait]
    impl QueueChannel for InMemoryChannel {
        async fn declare_topology(&self) -> Result<(), TransportError> {
            self.check_open()?;
            self.broker.declarations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, body: &[u8]) -> Result<(), TransportError> {
            self.check_open()?;
            self.broker.push_raw(body.to_vec());
            Ok(())
        }

        async fn get(&self) -> Result<Option<Delivery>, TransportError> {
            self.check_open()?;
            let mut state = self.broker.state.lock().unwrap();
            let Some((body, redelivered)) = state.ready.pop_front() else {
                return Ok(None);
            };
            let n = self.broker.next_tag.fetch_add(1, Ordering::SeqCst);
            let tag = DeliveryTag(format!("mem-{}", n));
            state.unacked.insert(tag.clone(), body.clone());
            Ok(Some(Delivery {
                tag,
                body,
                redelivered,
            }))
        }

        async fn ack(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
            self.check_open()?;
            let mut state = self.broker.state.lock().unwrap();
            let body = state
                .unacked
                .remove(tag)
                .ok_or_else(|| TransportError::UnknownDelivery(tag.clone()))?;
            state.acked.push(body);
            Ok(())
        }

        async fn nack_requeue(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
            self.check_open()?;
            let mut state = self.broker.state.lock().unwrap();
            let body = state
                .unacked
                .remove(tag)
                .ok_or_else(|| TransportError::UnknownDelivery(tag.clone()))?;
            state.ready.push_back((body, true));
            state.requeued += 1;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.broker.state.lock().unwrap().generation == self.generation
        }
    }
}
