use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::PipelineError,
    models::domain::{Appointment, AppointmentStatus},
};

const LEGACY_UPDATE_PREFIX: &str = "Appointment updated:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Results,
    Requests,
    Notifications,
    AppointmentUpdates,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Results,
        QueueName::Requests,
        QueueName::Notifications,
        QueueName::AppointmentUpdates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Results => "results",
            QueueName::Requests => "requests",
            QueueName::Notifications => "notifications",
            QueueName::AppointmentUpdates => "appointment_updates",
        }
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|queue| queue.as_str() == s.trim())
            .ok_or_else(|| PipelineError::Topology(format!("Unknown queue name: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ResultCreated,
    RequestCreated,
    AppointmentUpdated,
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::ResultCreated => write!(f, "result_created"),
            EventType::RequestCreated => write!(f, "request_created"),
            EventType::AppointmentUpdated => write!(f, "appointment_updated"),
        }
    }
}

/// Appointment as carried inside a `result_created` body. Only `pk` is
/// required; the other fields are informational, so a value of an unexpected
/// shape (a datetime instead of a date, a numeric status, a nested object)
/// reads as `None` instead of failing the whole message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentSnapshot {
    pub pk: i64,

    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub lab: Option<i64>,

    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub patient: Option<i64>,

    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_name: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub date: Option<NaiveDate>,

    #[serde(
        default,
        deserialize_with = "lenient_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<AppointmentStatus>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;

    Ok(serde_json::from_value(value).ok())
}

/// Accepts `YYYY-MM-DD` as well as RFC 3339 and naive datetimes.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::String(text) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };

    let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(&text)
                .ok()
                .map(|dt| dt.date_naive())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.date())
        });

    Ok(date)
}

/// Accepts the lowercase name or the stored integer code.
fn lenient_status<'de, D>(deserializer: D) -> Result<Option<AppointmentStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let status = match Value::deserialize(deserializer)? {
        Value::Number(code) => code
            .as_i64()
            .and_then(|code| i16::try_from(code).ok())
            .and_then(AppointmentStatus::from_i16),
        other => serde_json::from_value(other).ok(),
    };

    Ok(status)
}

impl From<&Appointment> for AppointmentSnapshot {
    fn from(appointment: &Appointment) -> Self {
        Self {
            pk: appointment.id,
            lab: Some(appointment.lab_id),
            patient: appointment.patient_id,
            service_name: Some(appointment.service_name.clone()),
            date: appointment.date,
            status: Some(appointment.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub lab_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<i64>,

    pub service_name: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentUpdate {
    pub appointment_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ResultEnvelope {
    ResultCreated(Vec<AppointmentSnapshot>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ResultCreated(Vec<AppointmentSnapshot>),
    RequestCreated(ServiceRequest),
    AppointmentUpdated(AppointmentUpdate),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::ResultCreated(_) => EventType::ResultCreated,
            EventPayload::RequestCreated(_) => EventType::RequestCreated,
            EventPayload::AppointmentUpdated(_) => EventType::AppointmentUpdated,
        }
    }

    /// Queue a producer addresses this payload to.
    pub fn queue(&self) -> QueueName {
        match self {
            EventPayload::ResultCreated(_) => QueueName::Notifications,
            EventPayload::RequestCreated(_) => QueueName::Requests,
            EventPayload::AppointmentUpdated(_) => QueueName::AppointmentUpdates,
        }
    }

    pub fn to_body(&self) -> Result<Vec<u8>, PipelineError> {
        let encoded = match self {
            EventPayload::ResultCreated(appointments) => {
                serde_json::to_vec(&ResultEnvelope::ResultCreated(appointments.clone()))
            }
            EventPayload::RequestCreated(request) => serde_json::to_vec(request),
            EventPayload::AppointmentUpdated(update) => serde_json::to_vec(update),
        };

        encoded.map_err(|e| PipelineError::Publish(format!("Failed to encode payload: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    pub accept_legacy_appointment_updates: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub payload: EventPayload,
    pub published_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            published_at: Some(Utc::now()),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Decodes a delivery body according to the wire format of the queue it arrived on.
    pub fn decode(
        queue: QueueName,
        body: &[u8],
        published_at: Option<DateTime<Utc>>,
        options: DecodeOptions,
    ) -> Result<Self, PipelineError> {
        let payload = match queue {
            QueueName::Notifications | QueueName::Results => decode_result_created(body)?,
            QueueName::Requests => decode_request_created(body)?,
            QueueName::AppointmentUpdates => decode_appointment_updated(body, options)?,
        };

        Ok(Self {
            payload,
            published_at,
        })
    }
}

fn decode_result_created(body: &[u8]) -> Result<EventPayload, PipelineError> {
    let envelope = serde_json::from_slice::<ResultEnvelope>(body)
        .map_err(|e| PipelineError::Decode(format!("Invalid result envelope: {}", e)))?;

    let ResultEnvelope::ResultCreated(appointments) = envelope;
    if appointments.is_empty() {
        return Err(PipelineError::Decode(
            "result_created carries no appointments".to_string(),
        ));
    }

    Ok(EventPayload::ResultCreated(appointments))
}

fn decode_request_created(body: &[u8]) -> Result<EventPayload, PipelineError> {
    let request = serde_json::from_slice::<ServiceRequest>(body)
        .map_err(|e| PipelineError::Decode(format!("Invalid service request: {}", e)))?;

    if request.service_name.trim().is_empty() {
        return Err(PipelineError::Decode(
            "Service request has an empty service_name".to_string(),
        ));
    }

    Ok(EventPayload::RequestCreated(request))
}

fn decode_appointment_updated(
    body: &[u8],
    options: DecodeOptions,
) -> Result<EventPayload, PipelineError> {
    match serde_json::from_slice::<AppointmentUpdate>(body) {
        Ok(update) => Ok(EventPayload::AppointmentUpdated(update)),
        Err(e) if options.accept_legacy_appointment_updates => parse_legacy_update(body)
            .map(EventPayload::AppointmentUpdated)
            .ok_or_else(|| PipelineError::Decode(format!("Invalid appointment update: {}", e))),
        Err(e) => Err(PipelineError::Decode(format!(
            "Invalid appointment update: {}",
            e
        ))),
    }
}

fn parse_legacy_update(body: &[u8]) -> Option<AppointmentUpdate> {
    let text = std::str::from_utf8(body).ok()?;
    let id = text.trim().strip_prefix(LEGACY_UPDATE_PREFIX)?.trim();

    id.parse()
        .ok()
        .map(|appointment_id| AppointmentUpdate { appointment_id })
}
