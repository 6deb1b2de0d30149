// libs/scheduling-cell/src/services/booking.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{DomainEvent, DomainEventKind, EventPublisher};
use crate::models::{
    Appointment, AppointmentStatus, BookAppointmentRequest, CancelAppointmentRequest,
    CancellationRecord, ConflictingSlot, ReminderChannel, RescheduleAppointmentRequest,
    ReschedulingRecord, ResourceRef, SchedulingError, SchedulingPolicy, TimeSlot,
};
use crate::services::attendance::AttendanceTrackingService;
use crate::services::conflict::ConflictDetectionService;
use crate::services::lifecycle::AppointmentLifecycleService;
use crate::store::{AppointmentStore, Clock, OpenResourceDirectory, ResourceDirectory, SystemClock};

/// Entry point for every booking caller: admin console, public booking, and
/// professional self-service all come through here.
///
/// The check-then-create sequence is a critical section per resource: a
/// lock keyed by professional (and room) id serializes contending bookings,
/// so at most one succeeds per overlapping interval. Mutations of a single
/// appointment are protected by optimistic versioning with bounded retries.
pub struct AppointmentBookingService {
    store: Arc<dyn AppointmentStore>,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn ResourceDirectory>,
    conflict_service: ConflictDetectionService,
    lifecycle_service: AppointmentLifecycleService,
    attendance_service: AttendanceTrackingService,
    events: EventPublisher,
    policy: SchedulingPolicy,
    resource_locks: StdMutex<HashMap<ResourceRef, Arc<AsyncMutex<()>>>>,
}

impl AppointmentBookingService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self::with_parts(
            store,
            Arc::new(SystemClock),
            SchedulingPolicy::default(),
            EventPublisher::unattached(),
        )
    }

    pub fn with_parts(
        store: Arc<dyn AppointmentStore>,
        clock: Arc<dyn Clock>,
        policy: SchedulingPolicy,
        events: EventPublisher,
    ) -> Self {
        let conflict_service = ConflictDetectionService::new(Arc::clone(&store));

        Self {
            store,
            clock,
            directory: Arc::new(OpenResourceDirectory),
            conflict_service,
            lifecycle_service: AppointmentLifecycleService::new(),
            attendance_service: AttendanceTrackingService::new(),
            events,
            policy,
            resource_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Wire the real patient/professional/service/room registries in place
    /// of the open default.
    pub fn with_resource_directory(mut self, directory: Arc<dyn ResourceDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Book a new appointment. Fails atomically with the list of colliding
    /// slots when the professional's or room's calendar is occupied.
    pub async fn book_appointment(
        &self,
        request: BookAppointmentRequest,
    ) -> Result<Appointment, SchedulingError> {
        info!(
            "Booking appointment for patient {} with professional {}",
            request.patient_id, request.professional_id
        );

        let now = self.clock.now();
        let slot = TimeSlot::new(request.start_time, request.end_time)?;
        self.validate_booking_window(slot, now)?;
        self.verify_participants(&request).await?;

        let _guards = self.acquire_resource_locks(request.professional_id, request.room_id).await;

        let conflicts = self
            .conflict_service
            .check_all(request.professional_id, request.room_id, slot, None)
            .await?;
        if !conflicts.is_empty() {
            warn!(
                "Rejecting booking for professional {}: {} conflicting slot(s)",
                request.professional_id,
                conflicts.len()
            );
            return Err(SchedulingError::ConflictDetected { conflicts });
        }

        let appointment = Appointment::new(&request, slot, now);
        self.store.insert(appointment.clone()).await?;

        self.emit(&appointment, DomainEventKind::AppointmentBooked, None, None);
        info!(
            "Appointment {} booked for professional {} at {}",
            appointment.id, appointment.professional_id, slot
        );
        Ok(appointment)
    }

    /// Pure status change; the window is untouched, so no conflict re-check.
    pub async fn confirm_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Confirming appointment {}", appointment_id);

        let lifecycle = &self.lifecycle_service;
        let (updated, previous) = self
            .mutate_with_retry(appointment_id, |appointment, _now| {
                lifecycle.validate_transition(appointment.status(), AppointmentStatus::Confirmed)?;
                appointment.status = AppointmentStatus::Confirmed;
                Ok(())
            })
            .await?;

        self.emit(&updated, DomainEventKind::AppointmentConfirmed, None, Some(previous));
        Ok(updated)
    }

    pub async fn cancel_appointment(
        &self,
        appointment_id: Uuid,
        request: CancelAppointmentRequest,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Cancelling appointment {}", appointment_id);

        if request.reason.trim().is_empty() {
            return Err(SchedulingError::ValidationError(
                "cancellation reason is required".to_string(),
            ));
        }

        let lifecycle = &self.lifecycle_service;
        let policy = &self.policy;
        let (updated, previous) = self
            .mutate_with_retry(appointment_id, |appointment, now| {
                lifecycle.ensure_cancellable(appointment, now, policy)?;
                appointment.status = AppointmentStatus::Cancelled;
                appointment.cancellation = Some(CancellationRecord {
                    cancelled_by: request.cancelled_by,
                    cancelled_by_id: request.cancelled_by_id,
                    cancelled_at: now,
                    reason: request.reason.clone(),
                    refund_issued: request.refund_issued,
                });
                Ok(())
            })
            .await?;

        self.emit(
            &updated,
            DomainEventKind::AppointmentCancelled,
            Some(request.cancelled_by_id),
            Some(previous),
        );
        info!("Appointment {} cancelled", appointment_id);
        Ok(updated)
    }

    /// Move the appointment to a new window on the same record: the old
    /// window goes into the rescheduling history, the counter increments,
    /// and every reminder flag resets.
    ///
    /// The lead-time rule is checked against the *current* start; the new
    /// window is conflict-checked under the same per-resource critical
    /// section as a fresh booking, excluding the appointment's own slot.
    pub async fn reschedule_appointment(
        &self,
        appointment_id: Uuid,
        request: RescheduleAppointmentRequest,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Rescheduling appointment {}", appointment_id);

        for attempt in 1..=self.policy.max_update_retries {
            let now = self.clock.now();
            let mut appointment = self
                .store
                .find_by_id(appointment_id)
                .await?
                .ok_or(SchedulingError::NotFound)?;
            let previous_status = appointment.status();
            let expected_version = appointment.version();

            self.lifecycle_service.ensure_reschedulable(&appointment, now, &self.policy)?;

            let new_end = request.new_end_time.unwrap_or_else(|| {
                request.new_start_time + ChronoDuration::minutes(appointment.duration_minutes())
            });
            let new_slot = TimeSlot::new(request.new_start_time, new_end)?;
            self.validate_booking_window(new_slot, now)?;

            let _guards = self
                .acquire_resource_locks(appointment.professional_id, appointment.room_id)
                .await;

            let conflicts = self
                .conflict_service
                .check_all(
                    appointment.professional_id,
                    appointment.room_id,
                    new_slot,
                    Some(appointment_id),
                )
                .await?;
            if !conflicts.is_empty() {
                warn!(
                    "Rejecting reschedule of {}: {} conflicting slot(s)",
                    appointment_id,
                    conflicts.len()
                );
                return Err(SchedulingError::ConflictDetected { conflicts });
            }

            let old_slot = appointment.slot();
            match &mut appointment.rescheduling {
                Some(record) => {
                    record.previous_windows.push(old_slot);
                    record.last_rescheduled_by = request.rescheduled_by;
                    record.last_reason = request.reason.clone();
                    record.rescheduling_count += 1;
                }
                None => {
                    appointment.rescheduling = Some(ReschedulingRecord {
                        previous_windows: vec![old_slot],
                        last_rescheduled_by: request.rescheduled_by,
                        last_reason: request.reason.clone(),
                        rescheduling_count: 1,
                    });
                }
            }
            appointment.slot = new_slot;
            self.attendance_service.reset_reminders(&mut appointment);
            appointment.updated_at = now;

            match self.store.update(appointment, expected_version).await {
                Ok(updated) => {
                    self.emit(
                        &updated,
                        DomainEventKind::AppointmentRescheduled,
                        Some(request.rescheduled_by),
                        Some(previous_status),
                    );
                    info!(
                        "Appointment {} rescheduled from {} to {}",
                        appointment_id, old_slot, new_slot
                    );
                    return Ok(updated);
                }
                Err(SchedulingError::VersionConflict) if attempt < self.policy.max_update_retries => {
                    warn!(
                        "Version conflict rescheduling {}, retrying ({}/{})",
                        appointment_id, attempt, self.policy.max_update_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(SchedulingError::VersionConflict)
    }

    pub async fn mark_arrived(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        let attendance = &self.attendance_service;
        let (updated, previous) = self
            .mutate_with_retry(appointment_id, |appointment, now| {
                attendance.mark_arrived(appointment, now)
            })
            .await?;

        self.emit(&updated, DomainEventKind::ArrivalRecorded, None, Some(previous));
        Ok(updated)
    }

    pub async fn start_session(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        let attendance = &self.attendance_service;
        let (updated, previous) = self
            .mutate_with_retry(appointment_id, |appointment, now| {
                attendance.start_session(appointment, now)
            })
            .await?;

        self.emit(&updated, DomainEventKind::SessionStarted, None, Some(previous));
        Ok(updated)
    }

    pub async fn end_session(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        let attendance = &self.attendance_service;
        let (updated, previous) = self
            .mutate_with_retry(appointment_id, |appointment, now| {
                attendance.end_session(appointment, now)
            })
            .await?;

        self.emit(&updated, DomainEventKind::SessionCompleted, None, Some(previous));
        Ok(updated)
    }

    /// Terminal no-show marking, once the start has passed without arrival.
    pub async fn mark_no_show(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        let lifecycle = &self.lifecycle_service;
        let (updated, previous) = self
            .mutate_with_retry(appointment_id, |appointment, now| {
                if !lifecycle.should_mark_no_show(appointment, now) {
                    return Err(SchedulingError::ValidationError(
                        "appointment is not eligible for no-show".to_string(),
                    ));
                }
                lifecycle.validate_transition(appointment.status(), AppointmentStatus::NoShow)?;
                appointment.status = AppointmentStatus::NoShow;
                Ok(())
            })
            .await?;

        self.emit(&updated, DomainEventKind::MarkedNoShow, None, Some(previous));
        info!("Appointment {} marked as no-show", appointment_id);
        Ok(updated)
    }

    pub async fn record_reminder_sent(
        &self,
        appointment_id: Uuid,
        channel: ReminderChannel,
    ) -> Result<Appointment, SchedulingError> {
        let attendance = &self.attendance_service;
        let (updated, previous) = self
            .mutate_with_retry(appointment_id, |appointment, _now| {
                attendance.record_reminder_sent(appointment, channel)
            })
            .await?;

        self.emit(&updated, DomainEventKind::ReminderSent, None, Some(previous));
        Ok(updated)
    }

    pub async fn can_be_cancelled(&self, appointment_id: Uuid) -> Result<bool, SchedulingError> {
        let appointment = self
            .store
            .find_by_id(appointment_id)
            .await?
            .ok_or(SchedulingError::NotFound)?;
        Ok(self.lifecycle_service.can_be_cancelled(&appointment, self.clock.now(), &self.policy))
    }

    pub async fn can_be_rescheduled(&self, appointment_id: Uuid) -> Result<bool, SchedulingError> {
        let appointment = self
            .store
            .find_by_id(appointment_id)
            .await?
            .ok_or(SchedulingError::NotFound)?;
        Ok(self.lifecycle_service.can_be_rescheduled(&appointment, self.clock.now(), &self.policy))
    }

    pub async fn get_appointment(&self, appointment_id: Uuid) -> Result<Appointment, SchedulingError> {
        self.store
            .find_by_id(appointment_id)
            .await?
            .ok_or(SchedulingError::NotFound)
    }

    /// Conflict probe for callers that want to offer alternatives before
    /// submitting a booking.
    pub async fn find_conflicts(
        &self,
        resource: ResourceRef,
        slot: TimeSlot,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<Vec<ConflictingSlot>, SchedulingError> {
        self.conflict_service.find_conflicts(resource, slot, exclude_appointment_id).await
    }

    pub async fn next_available_slot(
        &self,
        professional_id: Uuid,
        after: DateTime<Utc>,
        duration_minutes: i64,
        max_search_hours: i64,
    ) -> Result<Option<TimeSlot>, SchedulingError> {
        self.conflict_service
            .next_available_slot(professional_id, after, duration_minutes, max_search_hours)
            .await
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    async fn verify_participants(
        &self,
        request: &BookAppointmentRequest,
    ) -> Result<(), SchedulingError> {
        if !self.directory.patient_exists(request.patient_id).await? {
            return Err(SchedulingError::NotFound);
        }
        if !self.directory.professional_exists(request.professional_id).await? {
            return Err(SchedulingError::NotFound);
        }
        if !self.directory.service_exists(request.service_id).await? {
            return Err(SchedulingError::NotFound);
        }
        if let Some(room_id) = request.room_id {
            if !self.directory.room_exists(room_id).await? {
                return Err(SchedulingError::NotFound);
            }
        }
        Ok(())
    }

    fn validate_booking_window(
        &self,
        slot: TimeSlot,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        let duration = slot.duration_minutes();
        if duration < self.policy.min_duration_minutes || duration > self.policy.max_duration_minutes
        {
            return Err(SchedulingError::InvalidInterval(format!(
                "duration {} minutes outside allowed range {}..={} minutes",
                duration, self.policy.min_duration_minutes, self.policy.max_duration_minutes
            )));
        }

        if slot.start_time() <= now {
            return Err(SchedulingError::ValidationError(
                "appointment must start in the future".to_string(),
            ));
        }

        let horizon = now + ChronoDuration::days(self.policy.max_advance_booking_days);
        if slot.start_time() > horizon {
            return Err(SchedulingError::ValidationError(format!(
                "appointment cannot start more than {} days in advance",
                self.policy.max_advance_booking_days
            )));
        }

        Ok(())
    }

    /// One async mutex per resource id. Guards are acquired in canonical key
    /// order so a professional+room pair can never deadlock against another
    /// booking taking the same pair.
    async fn acquire_resource_locks(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut keys = vec![ResourceRef::Professional(professional_id)];
        if let Some(room_id) = room_id {
            keys.push(ResourceRef::Room(room_id));
        }
        keys.sort();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = {
                let mut map = match self.resource_locks.lock() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                Arc::clone(map.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Read-modify-write with optimistic versioning. On a version conflict
    /// the record is re-read and the mutation re-applied, a bounded number
    /// of times.
    async fn mutate_with_retry<F>(
        &self,
        appointment_id: Uuid,
        mut apply: F,
    ) -> Result<(Appointment, AppointmentStatus), SchedulingError>
    where
        F: FnMut(&mut Appointment, DateTime<Utc>) -> Result<(), SchedulingError>,
    {
        for attempt in 1..=self.policy.max_update_retries {
            let mut appointment = self
                .store
                .find_by_id(appointment_id)
                .await?
                .ok_or(SchedulingError::NotFound)?;
            let previous_status = appointment.status();
            let expected_version = appointment.version();
            let now = self.clock.now();

            apply(&mut appointment, now)?;
            appointment.updated_at = now;

            match self.store.update(appointment, expected_version).await {
                Ok(updated) => return Ok((updated, previous_status)),
                Err(SchedulingError::VersionConflict) if attempt < self.policy.max_update_retries => {
                    warn!(
                        "Version conflict updating appointment {}, retrying ({}/{})",
                        appointment_id, attempt, self.policy.max_update_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(SchedulingError::VersionConflict)
    }

    fn emit(
        &self,
        appointment: &Appointment,
        kind: DomainEventKind,
        actor: Option<Uuid>,
        previous_status: Option<AppointmentStatus>,
    ) {
        self.events.publish(DomainEvent {
            event_id: Uuid::new_v4(),
            appointment_id: appointment.id,
            kind,
            actor,
            previous_status,
            new_status: appointment.status(),
            occurred_at: self.clock.now(),
        });
    }
}
