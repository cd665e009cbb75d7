//! Turns decoded events into persisted notifications.
//!
//! Each handler runs its lookups and writes inside one store transaction, so a
//! failed lookup or insert leaves no partial rows behind.

use tracing::{debug, info};

use crate::{
    error::PipelineError,
    models::{
        domain::{
            Appointment, AppointmentStatus, Lab, NewAppointment, NewNotification, Notification,
            User,
        },
        event::{AppointmentSnapshot, AppointmentUpdate, Event, EventPayload, ServiceRequest},
    },
    store::{Store, StoreTx},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Created {
        notification: Notification,
        appointment: Option<Appointment>,
    },
    /// A notification for the same dedup key was already committed.
    Duplicate { notification_id: i64 },
}

pub async fn materialize<S>(
    store: &mut S,
    event: &Event,
    dedup_key: Option<&str>,
) -> Result<Outcome, PipelineError>
where
    S: Store + ?Sized,
{
    let mut tx = store.begin().await?;

    if let Some(key) = dedup_key {
        if let Some(existing) = tx.find_notification_by_dedup_key(key).await? {
            debug!(dedup_key = key, notification_id = existing.id, "Duplicate delivery");
            return Ok(Outcome::Duplicate {
                notification_id: existing.id,
            });
        }
    }

    let dedup_key = dedup_key.map(str::to_string);
    let outcome = match &event.payload {
        EventPayload::ResultCreated(appointments) => {
            on_result_created(&mut *tx, appointments, dedup_key).await?
        }
        EventPayload::RequestCreated(request) => {
            on_request_created(&mut *tx, request, dedup_key).await?
        }
        EventPayload::AppointmentUpdated(update) => {
            on_appointment_updated(&mut *tx, update, dedup_key).await?
        }
    };

    tx.commit().await?;

    if let Outcome::Created { notification, .. } = &outcome {
        info!(
            event_type = %event.event_type(),
            notification_id = notification.id,
            user_id = notification.user_id,
            appointment_id = notification.appointment_id,
            "Notification created"
        );
    }

    Ok(outcome)
}

async fn require_appointment(
    tx: &mut dyn StoreTx,
    id: i64,
) -> Result<Appointment, PipelineError> {
    tx.get_appointment(id)
        .await?
        .ok_or_else(|| PipelineError::not_found("Appointment", id))
}

async fn require_lab(tx: &mut dyn StoreTx, id: i64) -> Result<Lab, PipelineError> {
    tx.get_lab(id)
        .await?
        .ok_or_else(|| PipelineError::not_found("Lab", id))
}

async fn require_user(tx: &mut dyn StoreTx, id: i64) -> Result<User, PipelineError> {
    tx.get_user(id)
        .await?
        .ok_or_else(|| PipelineError::not_found("User", id))
}

/// Resolves the patient an appointment belongs to.
async fn require_patient(
    tx: &mut dyn StoreTx,
    appointment: &Appointment,
) -> Result<User, PipelineError> {
    let patient_id = appointment
        .patient_id
        .ok_or_else(|| PipelineError::not_found("Patient of appointment", appointment.id))?;

    require_user(tx, patient_id).await
}

/// Notifies the patient that a result was uploaded. Only the first listed
/// appointment is resolved; it anchors the notification.
async fn on_result_created(
    tx: &mut dyn StoreTx,
    appointments: &[AppointmentSnapshot],
    dedup_key: Option<String>,
) -> Result<Outcome, PipelineError> {
    let snapshot = appointments
        .first()
        .ok_or_else(|| PipelineError::Decode("result_created carries no appointments".into()))?;

    let appointment = require_appointment(tx, snapshot.pk).await?;
    let lab = require_lab(tx, appointment.lab_id).await?;
    let patient = require_patient(tx, &appointment).await?;

    let message = format!("Result added for appointment(s) {}", appointment);
    let notification = tx
        .create_notification(
            NewNotification::new(&lab, &patient, &appointment, message).with_dedup_key(dedup_key),
        )
        .await?;

    Ok(Outcome::Created {
        notification,
        appointment: None,
    })
}

/// Books a pending appointment and notifies the lab's owning user.
async fn on_request_created(
    tx: &mut dyn StoreTx,
    request: &ServiceRequest,
    dedup_key: Option<String>,
) -> Result<Outcome, PipelineError> {
    let lab = require_lab(tx, request.lab_id).await?;
    let owner = require_user(tx, lab.user_id).await?;

    if let Some(patient_id) = request.patient_id {
        require_user(tx, patient_id).await?;
    }

    let appointment = tx
        .create_appointment(NewAppointment {
            lab_id: lab.id,
            service_name: request.service_name.clone(),
            patient_id: request.patient_id,
            date: Some(request.date),
            status: AppointmentStatus::Pending,
        })
        .await?;

    let message = format!(
        "New request for {} on {}",
        request.service_name, request.date
    );
    let notification = tx
        .create_notification(
            NewNotification::new(&lab, &owner, &appointment, message).with_dedup_key(dedup_key),
        )
        .await?;

    Ok(Outcome::Created {
        notification,
        appointment: Some(appointment),
    })
}

/// Asks the patient to confirm or decline a changed appointment.
async fn on_appointment_updated(
    tx: &mut dyn StoreTx,
    update: &AppointmentUpdate,
    dedup_key: Option<String>,
) -> Result<Outcome, PipelineError> {
    let appointment = require_appointment(tx, update.appointment_id).await?;
    let lab = require_lab(tx, appointment.lab_id).await?;
    let patient = require_patient(tx, &appointment).await?;

    let message = format!(
        "Appointment request updated, please confirm or decline: {}",
        appointment
    );
    let notification = tx
        .create_notification(
            NewNotification::new(&lab, &patient, &appointment, message).with_dedup_key(dedup_key),
        )
        .await?;

    Ok(Outcome::Created {
        notification,
        appointment: None,
    })
}
