#![allow(dead_code)]

use appointment_notifier::{
    consumer::{DeliveryPolicy, Dispatcher},
    models::{
        domain::{Appointment, AppointmentStatus, Lab, User},
        event::{DecodeOptions, QueueName},
        retry::RetryConfig,
    },
    store::memory::MemoryStore,
};
use chrono::NaiveDate;

pub const PATIENT_ID: i64 = 3;
pub const LAB_OWNER_ID: i64 = 11;
pub const LAB_ID: i64 = 7;
pub const REQUEST_LAB_ID: i64 = 5;
pub const REQUEST_LAB_OWNER_ID: i64 = 12;
pub const APPOINTMENT_ID: i64 = 42;

fn user(id: i64, username: &str) -> User {
    User {
        id,
        username: username.to_string(),
        email: format!("{}@bhealth.test", username),
    }
}

/// Store holding Appointment 42 (lab 7, patient 3) and Lab 5 owned by user 12.
pub fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();

    store.insert_user(user(PATIENT_ID, "amina"));
    store.insert_user(user(LAB_OWNER_ID, "central-lab"));
    store.insert_user(user(REQUEST_LAB_OWNER_ID, "xray-lab"));

    store.insert_lab(Lab {
        id: LAB_ID,
        name: "Central Lab".to_string(),
        user_id: LAB_OWNER_ID,
    });
    store.insert_lab(Lab {
        id: REQUEST_LAB_ID,
        name: "Imaging Center".to_string(),
        user_id: REQUEST_LAB_OWNER_ID,
    });

    store.insert_appointment(Appointment {
        id: APPOINTMENT_ID,
        lab_id: LAB_ID,
        service_name: "Blood panel".to_string(),
        patient_id: Some(PATIENT_ID),
        date: NaiveDate::from_ymd_opt(2024, 1, 1),
        status: AppointmentStatus::Confirmed,
    });

    store
}

pub fn test_policy() -> DeliveryPolicy {
    DeliveryPolicy {
        redelivery: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_multiplier: 2,
        },
        decode: DecodeOptions::default(),
        dead_letter_not_found: false,
    }
}

pub fn dispatcher(queue: QueueName, store: &MemoryStore) -> Dispatcher<MemoryStore> {
    Dispatcher::new(queue, store.clone(), test_policy())
}
