//! Per-queue receive loops.
//!
//! A [`Dispatcher`] turns one delivery into a [`Disposition`]; the
//! [`QueueConsumer`] loop owns the broker link and applies that disposition
//! only after the materializer's transaction has committed.

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::StreamExt;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    clients::rbmq::{BrokerClient, inbound_from_delivery},
    config::Config,
    error::PipelineError,
    materializer::{Outcome, materialize},
    models::{
        event::{DecodeOptions, Event, QueueName},
        health::{DispatchStatsSnapshot, LoopState},
        message::{DlqMessage, InboundMessage, OutboundMessage},
        retry::RetryConfig,
    },
    producer::Publisher,
    store::Store,
    utils::jittered,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack { duplicate: bool },
    /// Republish with `attempt` as the redelivery count after `delay`, then ack.
    Retry {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// Drop without requeue.
    Reject { reason: String },
    /// Park on the dead-letter queue, then drop without requeue.
    DeadLetter { reason: String, poison: bool },
}

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub redelivery: RetryConfig,
    pub decode: DecodeOptions,
    pub dead_letter_not_found: bool,
}

impl DeliveryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            redelivery: config.redelivery_config(),
            decode: DecodeOptions {
                accept_legacy_appointment_updates: config.accept_legacy_appointment_updates,
            },
            dead_letter_not_found: config.dead_letter_not_found,
        }
    }

    pub fn disposition_for(&self, error: &PipelineError, redelivery_count: u32) -> Disposition {
        let reason = error.to_string();

        match error {
            PipelineError::Decode(_) => Disposition::DeadLetter {
                reason,
                poison: true,
            },
            e if e.is_transient() => {
                let attempt = redelivery_count.saturating_add(1);

                if attempt <= self.redelivery.max_attempts {
                    Disposition::Retry {
                        attempt,
                        delay: self.redelivery.delay_for_attempt(attempt),
                        reason,
                    }
                } else {
                    Disposition::DeadLetter {
                        reason: format!(
                            "{} (gave up after {} redeliveries)",
                            reason, redelivery_count
                        ),
                        poison: false,
                    }
                }
            }
            PipelineError::NotFound { .. } if self.dead_letter_not_found => {
                Disposition::DeadLetter {
                    reason,
                    poison: false,
                }
            }
            _ => Disposition::Reject { reason },
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    acked: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
    poison: AtomicU64,
}

impl DispatchStats {
    fn record(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Ack { duplicate: true } => &self.duplicates,
            Disposition::Ack { duplicate: false } => &self.acked,
            Disposition::Retry { .. } => &self.retried,
            Disposition::Reject { .. } => &self.rejected,
            Disposition::DeadLetter { poison, .. } => {
                if *poison {
                    self.poison.fetch_add(1, Ordering::Relaxed);
                }
                &self.dead_lettered
            }
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
        }
    }
}

pub struct Dispatcher<S> {
    queue: QueueName,
    store: S,
    policy: DeliveryPolicy,
    stats: Arc<DispatchStats>,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(queue: QueueName, store: S, policy: DeliveryPolicy) -> Self {
        Self {
            queue,
            store,
            policy,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<DispatchStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Decodes and handles one delivery. Never fails: every error becomes a
    /// disposition so the loop can move on to the next message.
    pub async fn dispatch(&mut self, message: &InboundMessage) -> Disposition {
        let disposition = self.handle(message).await;
        self.stats.record(&disposition);
        disposition
    }

    async fn handle(&mut self, message: &InboundMessage) -> Disposition {
        let message_id = message.message_id.as_deref().unwrap_or("-");

        let event = match Event::decode(
            self.queue,
            &message.body,
            message.published_at,
            self.policy.decode,
        ) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    queue = %self.queue,
                    message_id,
                    error = %e,
                    "Poison message, dead-lettering"
                );
                return self.policy.disposition_for(&e, message.redelivery_count);
            }
        };

        let dedup_key = message
            .message_id
            .as_ref()
            .map(|id| format!("{}:{}", self.queue, id));

        match materialize(&mut self.store, &event, dedup_key.as_deref()).await {
            Ok(Outcome::Created { .. }) => Disposition::Ack { duplicate: false },
            Ok(Outcome::Duplicate { notification_id }) => {
                info!(
                    queue = %self.queue,
                    message_id,
                    notification_id,
                    "Message already materialized, skipping"
                );
                Disposition::Ack { duplicate: true }
            }
            Err(e) => {
                let disposition = self.policy.disposition_for(&e, message.redelivery_count);

                if e.is_transient() {
                    warn!(
                        queue = %self.queue,
                        message_id,
                        event_type = %event.event_type(),
                        redelivery_count = message.redelivery_count,
                        error = %e,
                        "Transient handler failure"
                    );
                } else {
                    error!(
                        queue = %self.queue,
                        message_id,
                        event_type = %event.event_type(),
                        error = %e,
                        "Handler failed, message will not be requeued"
                    );
                }

                disposition
            }
        }
    }
}

/// Shared view of one consumer loop for the health endpoint.
#[derive(Debug)]
pub struct ConsumerStatus {
    state: RwLock<LoopState>,
    stats: Arc<DispatchStats>,
}

impl Default for ConsumerStatus {
    fn default() -> Self {
        Self {
            state: RwLock::new(LoopState::Starting),
            stats: Arc::new(DispatchStats::default()),
        }
    }
}

impl ConsumerStatus {
    pub fn state(&self) -> LoopState {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_state(&self, state: LoopState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }
}

enum LoopExit {
    Shutdown,
    StreamEnded,
}

pub struct QueueConsumer<S> {
    config: Config,
    dispatcher: Dispatcher<S>,
    status: Arc<ConsumerStatus>,
}

impl<S: Store + 'static> QueueConsumer<S> {
    pub fn new(config: Config, queue: QueueName, store: S) -> Self {
        let status = Arc::new(ConsumerStatus::default());
        let dispatcher = Dispatcher::new(queue, store, DeliveryPolicy::from_config(&config))
            .with_stats(Arc::clone(&status.stats));

        Self {
            config,
            dispatcher,
            status,
        }
    }

    pub fn status(&self) -> Arc<ConsumerStatus> {
        Arc::clone(&self.status)
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), PipelineError>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` flips to true. Dropped broker links are
    /// re-established; topology conflicts and exhausted connection retries
    /// are fatal for this loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let queue = self.dispatcher.queue();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                connected = BrokerClient::connect_with_retry(&self.config) => connected,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            let broker = match connected {
                Ok(broker) => broker,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Giving up on broker connection");
                    self.status.set_state(LoopState::Failed(e.to_string()));
                    return Err(e);
                }
            };

            match self.consume(&broker, &mut shutdown).await {
                Ok(LoopExit::Shutdown) => {
                    broker.close().await;
                    break;
                }
                Ok(LoopExit::StreamEnded) => {
                    warn!(queue = %queue, "Delivery stream ended, reconnecting");
                    self.status.set_state(LoopState::Reconnecting);
                }
                Err(e @ PipelineError::Topology(_)) => {
                    error!(queue = %queue, error = %e, "Topology conflict, operator action required");
                    self.status.set_state(LoopState::Failed(e.to_string()));
                    broker.close().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Broker link lost, reconnecting");
                    self.status.set_state(LoopState::Reconnecting);
                }
            }
        }

        info!(queue = %queue, "Consumer stopped");
        self.status.set_state(LoopState::Stopped);

        Ok(())
    }

    async fn consume(
        &mut self,
        broker: &BrokerClient,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<LoopExit, PipelineError> {
        let queue = self.dispatcher.queue();

        broker.declare_topology(queue).await?;

        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let mut consumer = broker.create_consumer(queue, &consumer_tag, false).await?;

        self.status.set_state(LoopState::Running);
        info!(queue = %queue, "Consuming");

        let exit = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        break LoopExit::Shutdown;
                    }
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let message = inbound_from_delivery(&delivery);
                        let disposition = self.dispatcher.dispatch(&message).await;

                        let settled =
                            settle(broker, queue, delivery.delivery_tag, &message, disposition, shutdown)
                                .await?;
                        if matches!(settled, Settled::Interrupted) {
                            break LoopExit::Shutdown;
                        }
                    }
                    Some(Err(e)) => {
                        return Err(PipelineError::Connection(format!("Delivery failed: {}", e)));
                    }
                    None => break LoopExit::StreamEnded,
                },
            }
        };

        if matches!(exit, LoopExit::Shutdown) {
            if let Err(e) = broker.cancel(&consumer_tag).await {
                warn!(queue = %queue, error = %e, "Failed to cancel consumer");
            }
        }

        Ok(exit)
    }
}

enum Settled {
    Done,
    /// Shutdown arrived during a retry backoff; the delivery is left unacked
    /// so the broker hands it out again once the channel closes.
    Interrupted,
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleeps for `delay` unless shutdown is requested first. Returns whether the
/// full delay elapsed.
pub async fn backoff(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        _ = shutdown_requested(shutdown) => false,
    }
}

async fn settle(
    broker: &BrokerClient,
    queue: QueueName,
    delivery_tag: u64,
    message: &InboundMessage,
    disposition: Disposition,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Settled, PipelineError> {
    match disposition {
        Disposition::Ack { .. } => broker.acknowledge(delivery_tag).await?,
        Disposition::Retry {
            attempt,
            delay,
            reason,
        } => {
            info!(
                queue = %queue,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Requeueing message with backoff"
            );

            if !backoff(jittered(delay), shutdown).await {
                info!(queue = %queue, attempt, "Shutdown during backoff, leaving message for redelivery");
                return Ok(Settled::Interrupted);
            }

            broker
                .publish_message(&OutboundMessage::redelivery(queue, message, attempt))
                .await?;
            broker.acknowledge(delivery_tag).await?
        }
        Disposition::Reject { .. } => broker.reject(delivery_tag, false).await?,
        Disposition::DeadLetter { reason, .. } => {
            broker
                .publish_to_dlq(&DlqMessage::new(queue, message, reason))
                .await?;
            broker.reject(delivery_tag, false).await?
        }
    }

    Ok(Settled::Done)
}
