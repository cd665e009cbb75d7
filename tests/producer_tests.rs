mod common;

use anyhow::Result;
use appointment_notifier::{
    error::PipelineError,
    models::{
        domain::{Appointment, AppointmentStatus, NewAppointment},
        event::{QueueName, ServiceRequest},
    },
    producer::{EventProducer, RecordingPublisher},
    store::{Store, StoreTx},
};
use chrono::NaiveDate;
use common::{APPOINTMENT_ID, LAB_ID, PATIENT_ID, REQUEST_LAB_ID, seeded_store};
use serde_json::{Value, json};

fn seeded_appointment() -> Appointment {
    Appointment {
        id: APPOINTMENT_ID,
        lab_id: LAB_ID,
        service_name: "Blood panel".to_string(),
        patient_id: Some(PATIENT_ID),
        date: NaiveDate::from_ymd_opt(2024, 1, 1),
        status: AppointmentStatus::Confirmed,
    }
}

/// Test: Each event type is routed to its queue with the expected body shape
#[tokio::test]
async fn test_events_are_routed_to_their_queues() -> Result<()> {
    let publisher = RecordingPublisher::new();
    let producer = EventProducer::new(publisher.clone());

    producer.publish_result_created(&seeded_appointment()).await?;
    producer
        .publish_request_created(&ServiceRequest {
            lab_id: 5,
            patient_id: None,
            service_name: "X-Ray".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
        })
        .await?;
    producer.publish_appointment_updated(APPOINTMENT_ID).await?;

    let messages = publisher.messages();
    let queues: Vec<QueueName> = messages.iter().map(|m| m.queue).collect();
    assert_eq!(
        queues,
        vec![
            QueueName::Notifications,
            QueueName::Requests,
            QueueName::AppointmentUpdates
        ]
    );

    let result: Value = serde_json::from_slice(&messages[0].body)?;
    assert_eq!(result["type"], "result_created");
    assert_eq!(result["data"][0]["pk"], APPOINTMENT_ID);
    assert_eq!(result["data"][0]["status"], "confirmed");

    let request: Value = serde_json::from_slice(&messages[1].body)?;
    assert_eq!(
        request,
        json!({"lab_id": 5, "service_name": "X-Ray", "date": "2024-01-01"})
    );

    let update: Value = serde_json::from_slice(&messages[2].body)?;
    assert_eq!(update, json!({"appointment_id": APPOINTMENT_ID}));

    Ok(())
}

/// Test: Every published message gets its own message id
#[tokio::test]
async fn test_message_ids_are_unique() -> Result<()> {
    let publisher = RecordingPublisher::new();
    let producer = EventProducer::new(publisher.clone());

    let first = producer.publish_appointment_updated(APPOINTMENT_ID).await?;
    let second = producer.publish_appointment_updated(APPOINTMENT_ID).await?;

    assert_ne!(first.message_id, second.message_id);
    assert_eq!(first.redelivery_count, 0);

    Ok(())
}

/// Test: A failed publish is reported while the committed domain write stays in place
#[tokio::test]
async fn test_publish_failure_keeps_committed_write() -> Result<()> {
    let mut store = seeded_store();
    let publisher = RecordingPublisher::failing();
    let producer = EventProducer::new(publisher.clone());

    let request = ServiceRequest {
        lab_id: REQUEST_LAB_ID,
        patient_id: Some(PATIENT_ID),
        service_name: "MRI".to_string(),
        date: NaiveDate::from_ymd_opt(2024, 3, 15).expect("valid date"),
    };

    let booked = {
        let mut tx = store.begin().await?;
        let booked = tx
            .create_appointment(NewAppointment {
                lab_id: request.lab_id,
                service_name: request.service_name.clone(),
                patient_id: request.patient_id,
                date: Some(request.date),
                status: AppointmentStatus::Pending,
            })
            .await?;
        tx.commit().await?;
        booked
    };

    let err = producer
        .publish_request_created(&request)
        .await
        .expect_err("publish must fail");

    assert!(matches!(err, PipelineError::Publish(_)));
    assert!(publisher.messages().is_empty());
    assert!(
        store.appointments().contains(&booked),
        "Committed appointment must survive the failed publish"
    );

    publisher.set_failing(false);
    producer.publish_request_created(&request).await?;
    assert_eq!(publisher.messages().len(), 1);
    assert!(store.appointments().contains(&booked));

    Ok(())
}
