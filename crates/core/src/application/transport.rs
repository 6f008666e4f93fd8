// Reconnecting queue transport
//
// Wraps a `QueueConnector` so that a dropped connection is detected on the
// next operation, re-established with bounded retries, and the topology is
// re-declared before the operation is replayed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::application::dispatcher::constants::{RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS};
use crate::application::retry::Backoff;
use crate::domain::JobMessage;
use crate::port::{Delivery, DeliveryTag, QueueChannel, QueueConnector, QueueTransport, TransportError};

pub struct ReconnectingTransport {
    connector: Arc<dyn QueueConnector>,
    channel: Mutex<Option<Arc<dyn QueueChannel>>>,
    max_attempts: u32,
    backoff: Backoff,
}

impl ReconnectingTransport {
    /// Connect once and declare topology.
    ///
    /// A failure here is returned as-is: being unable to reach the queue at
    /// startup is fatal for the process.
    pub async fn connect(connector: Arc<dyn QueueConnector>) -> Result<Self, TransportError> {
        let channel = connector.connect().await?;
        channel.declare_topology().await?;
        info!("Queue transport connected");
        Ok(Self {
            connector,
            channel: Mutex::new(Some(channel)),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
            backoff: Backoff::Linear(RECONNECT_BASE_DELAY),
        })
    }

    /// Override the reconnect budget (5 attempts, 2s linear by default)
    pub fn with_reconnect_policy(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = Backoff::Linear(base_delay);
        self
    }

    async fn current(&self) -> Result<Arc<dyn QueueChannel>, TransportError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            warn!("Queue connection lost, reconnecting");
        }
        *slot = None;
        let channel = self.reconnect().await?;
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn reconnect(&self) -> Result<Arc<dyn QueueChannel>, TransportError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.connector.connect().await {
                Ok(channel) => match channel.declare_topology().await {
                    Ok(()) => {
                        info!(attempt = %attempt, "Queue transport reconnected");
                        return Ok(channel);
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }

            if attempt < self.max_attempts {
                let delay = self.backoff.delay(attempt);
                warn!(
                    attempt = %attempt,
                    max_attempts = %self.max_attempts,
                    delay_ms = %delay.as_millis(),
                    error = %last_error,
                    "Reconnect attempt failed"
                );
                tokio::time::sleep(delay).await;
            }
        }

        error!(attempts = %self.max_attempts, error = %last_error, "Giving up on queue reconnection");
        Err(TransportError::ReconnectExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    async fn invalidate(&self, dead: &Arc<dyn QueueChannel>) {
        let mut slot = self.channel.lock().await;
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, dead)) {
            *slot = None;
        }
    }

    /// Run `op` on the live channel; on a connection error reconnect and replay it once
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, TransportError>
    where
        F: Fn(Arc<dyn QueueChannel>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let channel = self.current().await?;
        match op(Arc::clone(&channel)).await {
            Err(e) if e.is_connection_error() => {
                warn!(error = %e, "Queue operation hit a dead connection");
                self.invalidate(&channel).await;
                let channel = self.current().await?;
                op(channel).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl QueueTransport for ReconnectingTransport {
    async fn publish(&self, message: &JobMessage) -> Result<(), TransportError> {
        let body = message
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let body = body.as_slice();
        self.run(move |ch| async move { ch.publish(body).await }).await
    }

    async fn receive(&self) -> Result<Option<Delivery>, TransportError> {
        self.run(|ch| async move { ch.get().await }).await
    }

    async fn acknowledge(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
        self.run(move |ch| async move { ch.ack(tag).await }).await
    }

    async fn requeue(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
        self.run(move |ch| async move { ch.nack_requeue(tag).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, RuleSelection, Target};
    use crate::port::queue::mocks::InMemoryBroker;

    fn message(id: &str) -> JobMessage {
        JobMessage::from_job(&Job::new(
            id,
            Some("b-1".into()),
            Target::new("t-1", "example.com"),
            RuleSelection::All,
            0,
        ))
    }

    async fn transport(broker: &Arc<InMemoryBroker>) -> ReconnectingTransport {
        ReconnectingTransport::connect(Arc::new(Arc::clone(broker)))
            .await
            .unwrap()
            .with_reconnect_policy(5, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let broker = InMemoryBroker::new();
        let transport = transport(&broker).await;

        transport.publish(&message("j-1")).await.unwrap();
        let delivery = transport.receive().await.unwrap().unwrap();
        assert_eq!(JobMessage::decode(&delivery.body).unwrap().job_id, "j-1");

        transport.acknowledge(&delivery.tag).await.unwrap();
        assert!(transport.receive().await.unwrap().is_none());
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_and_redeclares_topology() {
        let broker = InMemoryBroker::new();
        let transport = transport(&broker).await;
        assert_eq!(broker.declarations(), 1);

        broker.sever();
        broker.refuse_connects(2);
        transport.publish(&message("j-1")).await.unwrap();

        // initial connect + 2 refused + 1 successful
        assert_eq!(broker.connects(), 4);
        assert_eq!(broker.declarations(), 2);
        assert_eq!(broker.ready_len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_budget_exhausted_is_fatal() {
        let broker = InMemoryBroker::new();
        let transport = transport(&broker).await;

        broker.sever();
        broker.refuse_connects(10);
        let err = transport.receive().await.unwrap_err();

        assert!(matches!(
            err,
            TransportError::ReconnectExhausted { attempts: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_unacked_message_redelivered_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let transport = transport(&broker).await;
        transport.publish(&message("j-1")).await.unwrap();

        let first = transport.receive().await.unwrap().unwrap();
        assert!(!first.redelivered);
        broker.sever();

        let second = transport.receive().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn test_startup_connect_failure() {
        let broker = InMemoryBroker::new();
        broker.refuse_connects(1);
        assert!(ReconnectingTransport::connect(Arc::new(broker)).await.is_err());
    }
}
