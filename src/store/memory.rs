use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{
    error::PipelineError,
    models::domain::{Appointment, Lab, NewAppointment, NewNotification, Notification, User},
    store::{Store, StoreTx},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Permanent,
}

impl InjectedFailure {
    fn into_error(self, context: &str) -> PipelineError {
        match self {
            InjectedFailure::Transient => PipelineError::TransientStore(context.to_string()),
            InjectedFailure::Permanent => PipelineError::Storage(context.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    users: Vec<User>,
    labs: Vec<Lab>,
    appointments: Vec<Appointment>,
    notifications: Vec<Notification>,
    next_appointment_id: i64,
    next_notification_id: i64,
    failing_transactions: u32,
    notification_insert_failure: Option<InjectedFailure>,
}

impl MemoryState {
    fn next_appointment_id(&mut self) -> i64 {
        let taken = self.appointments.iter().map(|a| a.id).max().unwrap_or(0);
        self.next_appointment_id = self.next_appointment_id.max(taken) + 1;
        self.next_appointment_id
    }

    fn next_notification_id(&mut self) -> i64 {
        self.next_notification_id += 1;
        self.next_notification_id
    }
}

/// Process-local store with the same transactional contract as PostgreSQL.
///
/// Clones share state, so a test can keep one handle for assertions while the
/// dispatcher owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_user(&self, user: User) {
        self.lock().users.push(user);
    }

    pub fn insert_lab(&self, lab: Lab) {
        self.lock().labs.push(lab);
    }

    pub fn insert_appointment(&self, appointment: Appointment) {
        self.lock().appointments.push(appointment);
    }

    pub fn appointments(&self) -> Vec<Appointment> {
        self.lock().appointments.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    /// Makes the next `count` transactions fail to start with a transient error.
    pub fn fail_next_transactions(&self, count: u32) {
        self.lock().failing_transactions = count;
    }

    pub fn fail_notification_inserts(&self, failure: Option<InjectedFailure>) {
        self.lock().notification_insert_failure = failure;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn StoreTx + 'a>, PipelineError> {
        let mut state = self.lock();
        if state.failing_transactions > 0 {
            state.failing_transactions -= 1;
            return Err(PipelineError::TransientStore(
                "injected connection failure".to_string(),
            ));
        }
        drop(state);

        Ok(Box::new(MemoryTx {
            store: &*self,
            appointments: Vec::new(),
            notifications: Vec::new(),
        }))
    }

    async fn health_check(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

struct MemoryTx<'a> {
    store: &'a MemoryStore,
    appointments: Vec<Appointment>,
    notifications: Vec<Notification>,
}

#[async_trait]
impl StoreTx for MemoryTx<'_> {
    async fn get_appointment(&mut self, id: i64) -> Result<Option<Appointment>, PipelineError> {
        let staged = self.appointments.iter().find(|a| a.id == id).cloned();
        Ok(staged.or_else(|| {
            self.store
                .lock()
                .appointments
                .iter()
                .find(|a| a.id == id)
                .cloned()
        }))
    }

    async fn get_lab(&mut self, id: i64) -> Result<Option<Lab>, PipelineError> {
        Ok(self.store.lock().labs.iter().find(|l| l.id == id).cloned())
    }

    async fn get_user(&mut self, id: i64) -> Result<Option<User>, PipelineError> {
        Ok(self.store.lock().users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_notification_by_dedup_key(
        &mut self,
        dedup_key: &str,
    ) -> Result<Option<Notification>, PipelineError> {
        let matches = |n: &&Notification| n.dedup_key.as_deref() == Some(dedup_key);

        let staged = self.notifications.iter().find(matches).cloned();
        Ok(staged.or_else(|| self.store.lock().notifications.iter().find(matches).cloned()))
    }

    async fn create_appointment(
        &mut self,
        appointment: NewAppointment,
    ) -> Result<Appointment, PipelineError> {
        let mut state = self.store.lock();
        if !state.labs.iter().any(|l| l.id == appointment.lab_id) {
            return Err(PipelineError::Storage(format!(
                "appointment references missing lab {}",
                appointment.lab_id
            )));
        }

        let created = Appointment {
            id: state.next_appointment_id(),
            lab_id: appointment.lab_id,
            service_name: appointment.service_name,
            patient_id: appointment.patient_id,
            date: appointment.date,
            status: appointment.status,
        };
        drop(state);

        self.appointments.push(created.clone());
        Ok(created)
    }

    async fn create_notification(
        &mut self,
        notification: NewNotification,
    ) -> Result<Notification, PipelineError> {
        let mut state = self.store.lock();
        if let Some(failure) = state.notification_insert_failure {
            return Err(failure.into_error("injected notification insert failure"));
        }

        let appointment_known = state
            .appointments
            .iter()
            .chain(self.appointments.iter())
            .any(|a| a.id == notification.appointment_id);
        let lab_known = state.labs.iter().any(|l| l.id == notification.lab_id);
        let user_known = state.users.iter().any(|u| u.id == notification.user_id);
        if !(appointment_known && lab_known && user_known) {
            return Err(PipelineError::Storage(
                "notification references a missing row".to_string(),
            ));
        }

        let created = Notification {
            id: state.next_notification_id(),
            lab_id: notification.lab_id,
            user_id: notification.user_id,
            appointment_id: notification.appointment_id,
            message: notification.message,
            is_confirmed: false,
            is_declined: false,
            dedup_key: notification.dedup_key,
        };
        drop(state);

        self.notifications.push(created.clone());
        Ok(created)
    }

    async fn commit(self: Box<Self>) -> Result<(), PipelineError> {
        let MemoryTx {
            store,
            appointments,
            notifications,
        } = *self;

        let mut state = store.lock();
        state.appointments.extend(appointments);
        state.notifications.extend(notifications);
        Ok(())
    }
}
