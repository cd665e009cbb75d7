use std::{collections::HashSet, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ErrorKind,
    ExchangeKind,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::AMQPSoftError,
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::PipelineError,
    models::{
        event::QueueName,
        message::{DlqMessage, InboundMessage, OutboundMessage},
    },
    producer::Publisher,
    utils::retry_with_backoff,
};

pub const REDELIVERY_HEADER: &str = "x-redelivery-count";
const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// One connection and one channel, owned by a single producer or consumer loop.
pub struct BrokerClient {
    connection: Connection,
    channel: Channel,
    exchange: String,
    exchange_kind: ExchangeKind,
    dead_letter_queue: String,
    declared: Mutex<HashSet<QueueName>>,
}

/// Maps a failed declare or bind. Only a broker-side PRECONDITION_FAILED
/// (an existing queue or exchange with different arguments) is a topology
/// conflict; anything else means the link is gone and is worth reconnecting.
pub fn classify_declare_error(context: String, error: &lapin::Error) -> PipelineError {
    match error.kind() {
        ErrorKind::ProtocolError(amqp)
            if amqp.get_id() == AMQPSoftError::PRECONDITIONFAILED.get_id() =>
        {
            PipelineError::Topology(format!("{}: {}", context, error))
        }
        _ => PipelineError::Connection(format!("{}: {}", context, error)),
    }
}

impl BrokerClient {
    pub async fn connect(config: &Config) -> Result<Self, PipelineError> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("Failed to connect to RabbitMQ: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PipelineError::Connection(format!("RabbitMQ channel creation failed: {}", e)))?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("Failed to set up QoS: {}", e)))?;

        let exchange_kind = config
            .exchange_kind()
            .map_err(|e| PipelineError::Topology(e.to_string()))?;

        info!(prefetch_count = config.prefetch_count, "RabbitMQ channel ready");

        Ok(Self {
            connection,
            channel,
            exchange: config.rabbitmq_exchange.clone(),
            exchange_kind,
            dead_letter_queue: config.dead_letter_queue.clone(),
            declared: Mutex::new(HashSet::new()),
        })
    }

    /// Connects with exponential backoff; only the final failure is returned.
    pub async fn connect_with_retry(config: &Config) -> Result<Self, PipelineError> {
        retry_with_backoff(&config.connect_retry_config(), "rabbitmq", || {
            Self::connect(config)
        })
        .await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn declare_queue(&self, name: &str) -> Result<(), PipelineError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_declare_error(format!("Failed to declare queue {}", name), &e))?;

        debug!(queue = name, "Queue declared");

        Ok(())
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), PipelineError> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_declare_error(format!("Failed to declare exchange {}", name), &e))?;

        debug!(exchange = name, "Exchange declared");

        Ok(())
    }

    /// Declares the queue, its exchange binding (if any) and the dead-letter queue.
    ///
    /// Redeclaring with identical parameters is a no-op on the broker; a
    /// mismatch fails with [`PipelineError::Topology`].
    pub async fn declare_topology(&self, queue: QueueName) -> Result<(), PipelineError> {
        self.declare_queue(queue.as_str()).await?;
        self.declare_queue(&self.dead_letter_queue).await?;

        if !self.exchange.is_empty() {
            self.declare_exchange(&self.exchange, self.exchange_kind.clone())
                .await?;

            self.channel
                .queue_bind(
                    queue.as_str(),
                    &self.exchange,
                    queue.as_str(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| classify_declare_error(format!("Failed to bind queue {}", queue), &e))?;
        }

        self.declared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(queue);

        info!(queue = %queue, exchange = %self.exchange, "Topology declared");

        Ok(())
    }

    /// Declares the topology for `queue` the first time this client publishes
    /// to it, so an event sent before any consumer has started is still queued.
    async fn ensure_topology(&self, queue: QueueName) -> Result<(), PipelineError> {
        let known = self
            .declared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&queue);

        if known {
            return Ok(());
        }

        self.declare_topology(queue).await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), PipelineError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if persistent { PERSISTENT } else { TRANSIENT });

        self.publish_with_properties(exchange, routing_key, body, properties)
            .await
    }

    async fn publish_with_properties(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), PipelineError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| PipelineError::Publish(format!("Failed to publish to {}: {}", routing_key, e)))?;

        Ok(())
    }

    pub async fn create_consumer(
        &self,
        queue: QueueName,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<Consumer, PipelineError> {
        let consumer = self
            .channel
            .basic_consume(
                queue.as_str(),
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PipelineError::Connection(format!("Failed to create consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag, "Consumer created for queue");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("Failed to acknowledge message: {}", e)))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), PipelineError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| PipelineError::Connection(format!("Failed to reject message: {}", e)))?;

        Ok(())
    }

    pub async fn publish_to_dlq(&self, message: &DlqMessage) -> Result<(), PipelineError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| PipelineError::Publish(format!("Failed to encode dlq message: {}", e)))?;

        self.publish("", &self.dead_letter_queue, &payload, true)
            .await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), PipelineError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("Failed to cancel consumer: {}", e)))?;

        Ok(())
    }

    pub async fn close(self) {
        if let Err(e) = self.channel.close(200, "consumer stopped").await {
            warn!(error = %e, "Failed to close RabbitMQ channel");
        }

        if let Err(e) = self.connection.close(200, "consumer stopped").await {
            warn!(error = %e, "Failed to close RabbitMQ connection");
        }
    }

    fn route(&self, queue: QueueName) -> (&str, &'static str) {
        (self.exchange.as_str(), queue.as_str())
    }
}

#[async_trait]
impl Publisher for BrokerClient {
    async fn publish_message(&self, message: &OutboundMessage) -> Result<(), PipelineError> {
        self.ensure_topology(message.queue).await?;

        let (exchange, routing_key) = self.route(message.queue);

        self.publish_with_properties(exchange, routing_key, &message.body, outbound_properties(message))
            .await
    }
}

fn outbound_properties(message: &OutboundMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        REDELIVERY_HEADER.into(),
        AMQPValue::LongUInt(message.redelivery_count),
    );

    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(PERSISTENT)
        .with_message_id(message.message_id.as_str().into())
        .with_timestamp(message.published_at.timestamp().max(0) as u64)
        .with_headers(headers)
}

fn redelivery_count(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers() else {
        return 0;
    };

    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == REDELIVERY_HEADER)
        .and_then(|(_, value)| match value {
            AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
            AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(0)
}

pub fn inbound_from_delivery(delivery: &Delivery) -> InboundMessage {
    let properties = &delivery.properties;

    InboundMessage {
        body: delivery.data.clone(),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        redelivery_count: redelivery_count(properties),
        published_at: (*properties.timestamp())
            .and_then(|seconds| i64::try_from(seconds).ok())
            .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0)),
    }
}
