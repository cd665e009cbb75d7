use std::fmt::{Display, Formatter, Result};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl AppointmentStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            AppointmentStatus::Pending => 0,
            AppointmentStatus::Confirmed => 1,
            AppointmentStatus::Canceled => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(AppointmentStatus::Pending),
            1 => Some(AppointmentStatus::Confirmed),
            2 => Some(AppointmentStatus::Canceled),
            _ => None,
        }
    }
}

impl Display for AppointmentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            AppointmentStatus::Pending => write!(f, "pending"),
            AppointmentStatus::Confirmed => write!(f, "confirmed"),
            AppointmentStatus::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    pub lab_id: i64,
    pub service_name: String,
    pub patient_id: Option<i64>,
    pub date: Option<NaiveDate>,
    pub status: AppointmentStatus,
}

impl Display for Appointment {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let date = self
            .date
            .map(|date| date.to_string())
            .unwrap_or_else(|| "unscheduled".to_string());

        write!(
            f,
            "#{} {} (lab {}, {}, {})",
            self.id, self.service_name, self.lab_id, date, self.status
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub lab_id: i64,
    pub service_name: String,
    pub patient_id: Option<i64>,
    pub date: Option<NaiveDate>,
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lab {
    pub id: i64,
    pub name: String,
    /// Account that manages the lab and receives its requests.
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub lab_id: i64,
    pub user_id: i64,
    pub appointment_id: i64,
    pub message: String,
    pub is_confirmed: bool,
    pub is_declined: bool,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub lab_id: i64,
    pub user_id: i64,
    pub appointment_id: i64,
    pub message: String,
    pub dedup_key: Option<String>,
}

impl NewNotification {
    pub fn new(lab: &Lab, user: &User, appointment: &Appointment, message: String) -> Self {
        Self {
            lab_id: lab.id,
            user_id: user.id,
            appointment_id: appointment.id,
            message,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, dedup_key: Option<String>) -> Self {
        self.dedup_key = dedup_key;
        self
    }
}
