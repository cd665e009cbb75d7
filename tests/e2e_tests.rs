mod common;

use anyhow::Result;
use appointment_notifier::{
    consumer::Disposition,
    models::{
        domain::AppointmentStatus,
        event::{QueueName, ServiceRequest},
        message::InboundMessage,
    },
    producer::{EventProducer, RecordingPublisher},
};
use chrono::NaiveDate;
use common::{
    APPOINTMENT_ID, LAB_ID, PATIENT_ID, REQUEST_LAB_ID, REQUEST_LAB_OWNER_ID, dispatcher,
    seeded_store,
};

/// Test: A result upload for appointment 42 notifies its patient
#[tokio::test]
async fn test_result_created_notifies_patient() -> Result<()> {
    let store = seeded_store();
    let mut dispatcher = dispatcher(QueueName::Notifications, &store);

    let message = InboundMessage::new(r#"{"type":"result_created","data":[{"pk":42}]}"#);
    let disposition = dispatcher.dispatch(&message).await;

    assert_eq!(disposition, Disposition::Ack { duplicate: false });

    let notifications = store.notifications();
    assert_eq!(notifications.len(), 1, "Exactly one notification expected");

    let notification = &notifications[0];
    assert_eq!(notification.lab_id, LAB_ID);
    assert_eq!(notification.user_id, PATIENT_ID);
    assert_eq!(notification.appointment_id, APPOINTMENT_ID);
    assert!(!notification.is_confirmed);
    assert!(!notification.is_declined);
    assert!(
        notification
            .message
            .contains("Result added for appointment(s)")
    );

    Ok(())
}

/// Test: A service request books a pending appointment and notifies the lab owner
#[tokio::test]
async fn test_request_created_books_appointment() -> Result<()> {
    let store = seeded_store();
    let appointments_before = store.appointments().len();
    let mut dispatcher = dispatcher(QueueName::Requests, &store);

    let message =
        InboundMessage::new(r#"{"lab_id":5,"service_name":"X-Ray","date":"2024-01-01"}"#);
    let disposition = dispatcher.dispatch(&message).await;

    assert_eq!(disposition, Disposition::Ack { duplicate: false });

    let appointments = store.appointments();
    assert_eq!(appointments.len(), appointments_before + 1);

    let booked = appointments
        .iter()
        .find(|a| a.lab_id == REQUEST_LAB_ID)
        .expect("new appointment for lab 5");
    assert_eq!(booked.service_name, "X-Ray");
    assert_eq!(booked.status, AppointmentStatus::Pending);
    assert_eq!(booked.date, NaiveDate::from_ymd_opt(2024, 1, 1));

    let notifications = store.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, REQUEST_LAB_OWNER_ID);
    assert_eq!(notifications[0].lab_id, REQUEST_LAB_ID);
    assert_eq!(notifications[0].appointment_id, booked.id);
    assert_eq!(notifications[0].message, "New request for X-Ray on 2024-01-01");

    Ok(())
}

/// Test: Appointment updates ask the patient to confirm or decline
#[tokio::test]
async fn test_appointment_update_notifies_patient() -> Result<()> {
    let store = seeded_store();
    let mut dispatcher = dispatcher(QueueName::AppointmentUpdates, &store);

    let disposition = dispatcher
        .dispatch(&InboundMessage::new(r#"{"appointment_id":42}"#))
        .await;

    assert_eq!(disposition, Disposition::Ack { duplicate: false });

    let notifications = store.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, PATIENT_ID);
    assert!(
        notifications[0]
            .message
            .starts_with("Appointment request updated, please confirm or decline:")
    );

    Ok(())
}

/// Test: Messages published by the producer are consumable as-is
#[tokio::test]
async fn test_producer_output_round_trips_through_dispatcher() -> Result<()> {
    let store = seeded_store();
    let publisher = RecordingPublisher::new();
    let producer = EventProducer::new(publisher.clone());

    let appointment = store
        .appointments()
        .into_iter()
        .find(|a| a.id == APPOINTMENT_ID)
        .expect("seeded appointment");

    producer.publish_result_created(&appointment).await?;
    producer
        .publish_request_created(&ServiceRequest {
            lab_id: REQUEST_LAB_ID,
            patient_id: Some(PATIENT_ID),
            service_name: "MRI".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 15).expect("valid date"),
        })
        .await?;
    producer.publish_appointment_updated(APPOINTMENT_ID).await?;

    for outbound in publisher.messages() {
        let mut dispatcher = dispatcher(outbound.queue, &store);
        let inbound = InboundMessage::new(outbound.body.clone())
            .with_message_id(outbound.message_id.clone());

        assert_eq!(
            dispatcher.dispatch(&inbound).await,
            Disposition::Ack { duplicate: false },
            "message on {} was not acknowledged",
            outbound.queue
        );
    }

    assert_eq!(store.notifications().len(), 3);

    Ok(())
}

/// Test: A poison message does not block the valid messages behind it
#[tokio::test]
async fn test_malformed_message_does_not_block_queue() -> Result<()> {
    let store = seeded_store();
    let mut dispatcher = dispatcher(QueueName::Notifications, &store);

    let poison = dispatcher
        .dispatch(&InboundMessage::new("{not json"))
        .await;
    assert!(matches!(
        poison,
        Disposition::DeadLetter { poison: true, .. }
    ));

    let valid = dispatcher
        .dispatch(&InboundMessage::new(
            r#"{"type":"result_created","data":[{"pk":42}]}"#,
        ))
        .await;
    assert_eq!(valid, Disposition::Ack { duplicate: false });

    assert_eq!(store.notifications().len(), 1);
    assert_eq!(dispatcher.stats().snapshot().poison, 1);
    assert_eq!(dispatcher.stats().snapshot().acked, 1);

    Ok(())
}

/// Test: References to missing rows are rejected without requeue and create nothing
#[tokio::test]
async fn test_missing_references_are_rejected() -> Result<()> {
    let store = seeded_store();

    let cases = [
        (
            QueueName::Notifications,
            r#"{"type":"result_created","data":[{"pk":999}]}"#,
        ),
        (
            QueueName::Requests,
            r#"{"lab_id":404,"service_name":"X-Ray","date":"2024-01-01"}"#,
        ),
        (QueueName::AppointmentUpdates, r#"{"appointment_id":999}"#),
    ];

    for (queue, body) in cases {
        let mut dispatcher = dispatcher(queue, &store);
        let disposition = dispatcher.dispatch(&InboundMessage::new(body)).await;

        assert!(
            matches!(disposition, Disposition::Reject { .. }),
            "{} message should be rejected, got {:?}",
            queue,
            disposition
        );
    }

    assert!(store.notifications().is_empty());
    assert_eq!(store.appointments().len(), 1, "No appointment may be booked");

    Ok(())
}

/// Test: Result snapshots carrying full appointment fields still notify the patient
#[tokio::test]
async fn test_result_snapshot_with_datetime_and_status_code() -> Result<()> {
    let store = seeded_store();
    let mut dispatcher = dispatcher(QueueName::Notifications, &store);

    for body in [
        r#"{"type":"result_created","data":[{"pk":42,"lab":7,"date":"2024-01-01T10:00:00Z"}]}"#,
        r#"{"type":"result_created","data":[{"pk":42,"status":0}]}"#,
    ] {
        let disposition = dispatcher.dispatch(&InboundMessage::new(body)).await;
        assert_eq!(
            disposition,
            Disposition::Ack { duplicate: false },
            "body {} was not acknowledged",
            body
        );
    }

    let notifications = store.notifications();
    assert_eq!(notifications.len(), 2);
    assert!(notifications.iter().all(|n| n.user_id == PATIENT_ID));
    assert_eq!(dispatcher.stats().snapshot().poison, 0);

    Ok(())
}
