//! Publishes domain events after the triggering write has committed.
//!
//! Publishing is not coupled to the domain write: a failed publish surfaces
//! to the caller as [`PipelineError::Publish`] while the committed row stays
//! in place, and the caller decides whether to retry the whole action.

use std::sync::Arc;
#[cfg(feature = "test-util")]
use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    error::PipelineError,
    models::{
        domain::Appointment,
        event::{AppointmentSnapshot, AppointmentUpdate, Event, EventPayload, ServiceRequest},
        message::OutboundMessage,
    },
};

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_message(&self, message: &OutboundMessage) -> Result<(), PipelineError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish_message(&self, message: &OutboundMessage) -> Result<(), PipelineError> {
        (**self).publish_message(message).await
    }
}

pub struct EventProducer<P> {
    publisher: P,
}

impl<P: Publisher> EventProducer<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    /// Announces an uploaded result on the `notifications` queue.
    pub async fn publish_result_created(
        &self,
        appointment: &Appointment,
    ) -> Result<OutboundMessage, PipelineError> {
        let payload = EventPayload::ResultCreated(vec![AppointmentSnapshot::from(appointment)]);

        self.publish_event(Event::new(payload)).await
    }

    pub async fn publish_request_created(
        &self,
        request: &ServiceRequest,
    ) -> Result<OutboundMessage, PipelineError> {
        self.publish_event(Event::new(EventPayload::RequestCreated(request.clone())))
            .await
    }

    pub async fn publish_appointment_updated(
        &self,
        appointment_id: i64,
    ) -> Result<OutboundMessage, PipelineError> {
        let payload = EventPayload::AppointmentUpdated(AppointmentUpdate { appointment_id });

        self.publish_event(Event::new(payload)).await
    }

    pub async fn publish_event(&self, event: Event) -> Result<OutboundMessage, PipelineError> {
        let body = event.payload.to_body()?;
        let published_at = event.published_at.unwrap_or_else(chrono::Utc::now);
        let message = OutboundMessage::new(event.payload.queue(), body, published_at);

        if let Err(e) = self.publisher.publish_message(&message).await {
            warn!(
                queue = %message.queue,
                event_type = %event.event_type(),
                error = %e,
                "Event publish failed"
            );
            return Err(e);
        }

        info!(
            queue = %message.queue,
            event_type = %event.event_type(),
            message_id = %message.message_id,
            "Event published"
        );

        Ok(message)
    }
}

/// Publisher that keeps messages in memory, optionally failing every publish.
#[cfg(feature = "test-util")]
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
    fail: Arc<AtomicBool>,
}

#[cfg(feature = "test-util")]
impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let publisher = Self::default();
        publisher.set_failing(true);
        publisher
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(feature = "test-util")]
#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish_message(&self, message: &OutboundMessage) -> Result<(), PipelineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::Publish("broker connection lost".to_string()));
        }

        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.clone());
        Ok(())
    }
}
