use async_trait::async_trait;

use crate::{
    error::PipelineError,
    models::domain::{Appointment, Lab, NewAppointment, NewNotification, Notification, User},
};

#[cfg(feature = "test-util")]
pub mod memory;

/// Data-access seam consumed by the materializer.
///
/// Every handler invocation runs inside one [`StoreTx`]; dropping the
/// transaction without calling [`StoreTx::commit`] discards its writes.
#[async_trait]
pub trait Store: Send {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn StoreTx + 'a>, PipelineError>;

    async fn health_check(&mut self) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn get_appointment(&mut self, id: i64) -> Result<Option<Appointment>, PipelineError>;

    async fn get_lab(&mut self, id: i64) -> Result<Option<Lab>, PipelineError>;

    async fn get_user(&mut self, id: i64) -> Result<Option<User>, PipelineError>;

    async fn find_notification_by_dedup_key(
        &mut self,
        dedup_key: &str,
    ) -> Result<Option<Notification>, PipelineError>;

    async fn create_appointment(
        &mut self,
        appointment: NewAppointment,
    ) -> Result<Appointment, PipelineError>;

    async fn create_notification(
        &mut self,
        notification: NewNotification,
    ) -> Result<Notification, PipelineError>;

    async fn commit(self: Box<Self>) -> Result<(), PipelineError>;
}
