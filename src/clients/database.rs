use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row, Transaction};
use tracing::{debug, error, info, warn};

use crate::{
    error::PipelineError,
    models::domain::{
        Appointment, AppointmentStatus, Lab, NewAppointment, NewNotification, Notification, User,
    },
    store::{Store, StoreTx},
};

const APPOINTMENT_COLUMNS: &str = "id, lab_id, service_name, patient_id, date, status";
const NOTIFICATION_COLUMNS: &str =
    "id, lab_id, user_id, appointment_id, message, is_confirmed, is_declined, dedup_key";

pub struct DatabaseClient {
    database_url: String,
    client: Client,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        info!("Connecting to PostgreSQL database");

        let client = open(database_url).await?;

        info!("PostgreSQL connection established");

        Ok(Self {
            database_url: database_url.to_string(),
            client,
        })
    }

    async fn ensure_connected(&mut self) -> Result<(), PipelineError> {
        if self.client.is_closed() {
            warn!("PostgreSQL connection closed, reconnecting");
            self.client = open(&self.database_url).await?;
        }

        Ok(())
    }
}

async fn open(database_url: &str) -> Result<Client, PipelineError> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(classify)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "PostgreSQL connection terminated");
        }
    });

    Ok(client)
}

/// SQLSTATE classes worth retrying: connection exceptions, transaction
/// rollbacks, resource exhaustion, admin shutdown and unique violations
/// (a concurrent consumer inserted the same dedup key first).
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("40")
        || code.starts_with("53")
        || code == "57P01"
        || code == "23505"
}

fn classify(e: tokio_postgres::Error) -> PipelineError {
    if e.is_closed() {
        return PipelineError::TransientStore(e.to_string());
    }

    match e.code() {
        Some(code) if is_transient_sqlstate(code.code()) => {
            PipelineError::TransientStore(e.to_string())
        }
        Some(_) => PipelineError::Storage(e.to_string()),
        None => PipelineError::TransientStore(e.to_string()),
    }
}

fn column<'r, T>(row: &'r Row, name: &str) -> Result<T, PipelineError>
where
    T: tokio_postgres::types::FromSql<'r>,
{
    row.try_get(name)
        .map_err(|e| PipelineError::Storage(format!("Unreadable column {}: {}", name, e)))
}

fn appointment_from_row(row: &Row) -> Result<Appointment, PipelineError> {
    let status: i16 = column(row, "status")?;

    Ok(Appointment {
        id: column(row, "id")?,
        lab_id: column(row, "lab_id")?,
        service_name: column(row, "service_name")?,
        patient_id: column(row, "patient_id")?,
        date: column(row, "date")?,
        status: AppointmentStatus::from_i16(status).ok_or_else(|| {
            PipelineError::Storage(format!("Unknown appointment status {}", status))
        })?,
    })
}

fn notification_from_row(row: &Row) -> Result<Notification, PipelineError> {
    Ok(Notification {
        id: column(row, "id")?,
        lab_id: column(row, "lab_id")?,
        user_id: column(row, "user_id")?,
        appointment_id: column(row, "appointment_id")?,
        message: column(row, "message")?,
        is_confirmed: column(row, "is_confirmed")?,
        is_declined: column(row, "is_declined")?,
        dedup_key: column(row, "dedup_key")?,
    })
}

#[async_trait]
impl Store for DatabaseClient {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn StoreTx + 'a>, PipelineError> {
        self.ensure_connected().await?;

        let tx = self.client.transaction().await.map_err(classify)?;

        Ok(Box::new(PgTx { tx }))
    }

    async fn health_check(&mut self) -> Result<(), PipelineError> {
        self.ensure_connected().await?;

        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(classify)?;

        Ok(())
    }
}

struct PgTx<'a> {
    tx: Transaction<'a>,
}

#[async_trait]
impl StoreTx for PgTx<'_> {
    async fn get_appointment(&mut self, id: i64) -> Result<Option<Appointment>, PipelineError> {
        let query = format!("SELECT {} FROM appointments WHERE id = $1", APPOINTMENT_COLUMNS);

        let row = self
            .tx
            .query_opt(query.as_str(), &[&id])
            .await
            .map_err(classify)?;

        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn get_lab(&mut self, id: i64) -> Result<Option<Lab>, PipelineError> {
        let row = self
            .tx
            .query_opt("SELECT id, name, user_id FROM labs WHERE id = $1", &[&id])
            .await
            .map_err(classify)?;

        row.map(|row| {
            Ok(Lab {
                id: column(&row, "id")?,
                name: column(&row, "name")?,
                user_id: column(&row, "user_id")?,
            })
        })
        .transpose()
    }

    async fn get_user(&mut self, id: i64) -> Result<Option<User>, PipelineError> {
        let row = self
            .tx
            .query_opt("SELECT id, username, email FROM users WHERE id = $1", &[&id])
            .await
            .map_err(classify)?;

        row.map(|row| {
            Ok(User {
                id: column(&row, "id")?,
                username: column(&row, "username")?,
                email: column(&row, "email")?,
            })
        })
        .transpose()
    }

    async fn find_notification_by_dedup_key(
        &mut self,
        dedup_key: &str,
    ) -> Result<Option<Notification>, PipelineError> {
        let query = format!(
            "SELECT {} FROM notifications WHERE dedup_key = $1",
            NOTIFICATION_COLUMNS
        );

        let row = self
            .tx
            .query_opt(query.as_str(), &[&dedup_key])
            .await
            .map_err(classify)?;

        row.as_ref().map(notification_from_row).transpose()
    }

    async fn create_appointment(
        &mut self,
        appointment: NewAppointment,
    ) -> Result<Appointment, PipelineError> {
        let query = format!(
            "INSERT INTO appointments (lab_id, service_name, patient_id, date, status) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            APPOINTMENT_COLUMNS
        );
        let status = appointment.status.as_i16();

        let row = self
            .tx
            .query_one(
                query.as_str(),
                &[
                    &appointment.lab_id,
                    &appointment.service_name,
                    &appointment.patient_id,
                    &appointment.date,
                    &status,
                ],
            )
            .await
            .map_err(classify)?;

        let created = appointment_from_row(&row)?;
        debug!(appointment_id = created.id, "Appointment row inserted");

        Ok(created)
    }

    async fn create_notification(
        &mut self,
        notification: NewNotification,
    ) -> Result<Notification, PipelineError> {
        let query = format!(
            "INSERT INTO notifications \
             (lab_id, user_id, appointment_id, message, is_confirmed, is_declined, dedup_key) \
             VALUES ($1, $2, $3, $4, FALSE, FALSE, $5) RETURNING {}",
            NOTIFICATION_COLUMNS
        );

        let row = self
            .tx
            .query_one(
                query.as_str(),
                &[
                    &notification.lab_id,
                    &notification.user_id,
                    &notification.appointment_id,
                    &notification.message,
                    &notification.dedup_key,
                ],
            )
            .await
            .map_err(classify)?;

        let created = notification_from_row(&row)?;
        debug!(notification_id = created.id, "Notification row inserted");

        Ok(created)
    }

    async fn commit(self: Box<Self>) -> Result<(), PipelineError> {
        let PgTx { tx } = *self;

        tx.commit().await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_sqlstates() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("53300"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(is_transient_sqlstate("23505"));
    }

    #[test]
    fn constraint_and_syntax_errors_are_permanent() {
        assert!(!is_transient_sqlstate("23503"));
        assert!(!is_transient_sqlstate("42P01"));
        assert!(!is_transient_sqlstate("22P02"));
    }
}
