// libs/scheduling-cell/src/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Appointment, ResourceRef, SchedulingError, TimeSlot};

/// Injectable wall clock so lead-time and attendance rules are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Existence checks for booking participants. Patient, professional,
/// service, and room records are owned by external collaborators; the core
/// only asks whether a referenced id is real.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn patient_exists(&self, id: Uuid) -> Result<bool, SchedulingError>;
    async fn professional_exists(&self, id: Uuid) -> Result<bool, SchedulingError>;
    async fn service_exists(&self, id: Uuid) -> Result<bool, SchedulingError>;
    async fn room_exists(&self, id: Uuid) -> Result<bool, SchedulingError>;
}

/// Directory that accepts every id. Deployments wire the real registries;
/// tests and single-cell setups run open.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenResourceDirectory;

#[async_trait]
impl ResourceDirectory for OpenResourceDirectory {
    async fn patient_exists(&self, _id: Uuid) -> Result<bool, SchedulingError> {
        Ok(true)
    }

    async fn professional_exists(&self, _id: Uuid) -> Result<bool, SchedulingError> {
        Ok(true)
    }

    async fn service_exists(&self, _id: Uuid) -> Result<bool, SchedulingError> {
        Ok(true)
    }

    async fn room_exists(&self, _id: Uuid) -> Result<bool, SchedulingError> {
        Ok(true)
    }
}

/// Persistence port for the scheduling core. The production backend lives
/// outside this crate; the core only relies on this narrow contract.
///
/// `update` carries the caller's `expected_version`: a mismatch with the
/// stored record yields `VersionConflict` and leaves the record untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Appointment>, SchedulingError>;

    /// Active appointments for a resource that overlap the hint window.
    /// Active means not cancelled, not no-show, and not soft-deleted.
    async fn find_active_by_resource(
        &self,
        resource: ResourceRef,
        window_hint: TimeSlot,
    ) -> Result<Vec<Appointment>, SchedulingError>;

    async fn insert(&self, appointment: Appointment) -> Result<(), SchedulingError>;

    async fn update(
        &self,
        appointment: Appointment,
        expected_version: i64,
    ) -> Result<Appointment, SchedulingError>;
}

/// In-memory store used by tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    records: RwLock<HashMap<Uuid, Appointment>>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft-delete: the record stays for audit retention but disappears from
    /// every query, conflict scans included.
    pub async fn soft_delete(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), SchedulingError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(SchedulingError::NotFound)?;
        record.deleted_at = Some(now);
        record.version += 1;
        record.updated_at = now;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Appointment>, SchedulingError> {
        let records = self.records.read().await;
        Ok(records.get(&id).filter(|a| !a.is_deleted()).cloned())
    }

    async fn find_active_by_resource(
        &self,
        resource: ResourceRef,
        window_hint: TimeSlot,
    ) -> Result<Vec<Appointment>, SchedulingError> {
        let records = self.records.read().await;
        let mut matches: Vec<Appointment> = records
            .values()
            .filter(|a| a.occupies(resource))
            .filter(|a| !a.is_deleted() && a.status().blocks_schedule())
            .filter(|a| a.slot().overlaps(&window_hint))
            .cloned()
            .collect();
        matches.sort_by_key(|a| a.start_time());
        Ok(matches)
    }

    async fn insert(&self, appointment: Appointment) -> Result<(), SchedulingError> {
        let mut records = self.records.write().await;
        if records.contains_key(&appointment.id) {
            return Err(SchedulingError::StorageError(format!(
                "appointment {} already exists",
                appointment.id
            )));
        }
        records.insert(appointment.id, appointment);
        Ok(())
    }

    async fn update(
        &self,
        mut appointment: Appointment,
        expected_version: i64,
    ) -> Result<Appointment, SchedulingError> {
        let mut records = self.records.write().await;
        let current = records.get(&appointment.id).ok_or(SchedulingError::NotFound)?;
        if current.version != expected_version {
            return Err(SchedulingError::VersionConflict);
        }
        appointment.version = expected_version + 1;
        records.insert(appointment.id, appointment.clone());
        Ok(appointment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::appointment;
    use crate::models::AppointmentStatus;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).single().expect("valid timestamp")
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemoryAppointmentStore::new();
        let appt = appointment(Uuid::new_v4(), None, at(10), at(11), AppointmentStatus::Pending);
        store.insert(appt.clone()).await.unwrap();

        let updated = store.update(appt.clone(), 1).await.unwrap();
        assert_eq!(updated.version(), 2);

        // A writer still holding version 1 must lose.
        let err = store.update(appt, 1).await.unwrap_err();
        assert!(matches!(err, SchedulingError::VersionConflict));
    }

    #[tokio::test]
    async fn active_scan_skips_released_and_deleted_records() {
        let store = InMemoryAppointmentStore::new();
        let professional_id = Uuid::new_v4();

        let active = appointment(professional_id, None, at(10), at(11), AppointmentStatus::Confirmed);
        let cancelled = appointment(professional_id, None, at(10), at(11), AppointmentStatus::Cancelled);
        let deleted = appointment(professional_id, None, at(10), at(11), AppointmentStatus::Confirmed);

        store.insert(active.clone()).await.unwrap();
        store.insert(cancelled).await.unwrap();
        store.insert(deleted.clone()).await.unwrap();
        store.soft_delete(deleted.id, at(9)).await.unwrap();

        let hint = TimeSlot::new(at(9), at(12)).unwrap();
        let found = store
            .find_active_by_resource(ResourceRef::Professional(professional_id), hint)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, active.id);
    }

    #[tokio::test]
    async fn soft_deleted_records_disappear_from_lookup() {
        let store = InMemoryAppointmentStore::new();
        let appt = appointment(Uuid::new_v4(), None, at(10), at(11), AppointmentStatus::Pending);
        store.insert(appt.clone()).await.unwrap();
        store.soft_delete(appt.id, at(9)).await.unwrap();

        assert!(store.find_by_id(appt.id).await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }
}
