// libs/scheduling-cell/src/services/conflict.rs
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{ConflictingSlot, ResourceRef, SchedulingError, TimeSlot};
use crate::store::AppointmentStore;

const SLOT_SEARCH_STEP_MINUTES: i64 = 30;

pub struct ConflictDetectionService {
    store: Arc<dyn AppointmentStore>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    /// Active bookings for a resource that overlap the proposed slot.
    ///
    /// Overlap is half-open: a booking ending exactly when the proposed slot
    /// begins does not collide. Conflicts come back as data; the caller
    /// decides whether to reject or to propose alternatives.
    pub async fn find_conflicts(
        &self,
        resource: ResourceRef,
        slot: TimeSlot,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<Vec<ConflictingSlot>, SchedulingError> {
        debug!(
            "Checking conflicts for {} {} over {}",
            resource.kind(),
            resource.id(),
            slot
        );

        let existing = self.store.find_active_by_resource(resource, slot).await?;

        let conflicts: Vec<ConflictingSlot> = existing
            .into_iter()
            .filter(|appt| Some(appt.id) != exclude_appointment_id)
            .filter(|appt| appt.slot().overlaps(&slot))
            .map(|appt| ConflictingSlot {
                appointment_id: appt.id,
                slot: appt.slot(),
                status: appt.status(),
            })
            .collect();

        if !conflicts.is_empty() {
            warn!(
                "Conflict detected for {} {}: {} overlapping booking(s)",
                resource.kind(),
                resource.id(),
                conflicts.len()
            );
        }

        Ok(conflicts)
    }

    /// Checks the professional's calendar and, when a room is assigned, the
    /// room's calendar. The two invariants are independent; a collision on
    /// either rejects the proposed booking.
    pub async fn check_all(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        slot: TimeSlot,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<Vec<ConflictingSlot>, SchedulingError> {
        let mut conflicts = self
            .find_conflicts(ResourceRef::Professional(professional_id), slot, exclude_appointment_id)
            .await?;

        if let Some(room_id) = room_id {
            let room_conflicts = self
                .find_conflicts(ResourceRef::Room(room_id), slot, exclude_appointment_id)
                .await?;
            for conflict in room_conflicts {
                if !conflicts.iter().any(|c| c.appointment_id == conflict.appointment_id) {
                    conflicts.push(conflict);
                }
            }
        }

        Ok(conflicts)
    }

    /// Conflict probe with the slot widened by a buffer on both sides, for
    /// services that need preparation or cleanup time around the booking.
    pub async fn check_with_buffer(
        &self,
        resource: ResourceRef,
        slot: TimeSlot,
        buffer_minutes: i64,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<Vec<ConflictingSlot>, SchedulingError> {
        self.find_conflicts(resource, slot.widened_by(buffer_minutes), exclude_appointment_id)
            .await
    }

    /// First clear window for the professional at or after `after`, scanning
    /// in 30-minute steps. Bounded by `max_search_hours`.
    pub async fn next_available_slot(
        &self,
        professional_id: Uuid,
        after: DateTime<Utc>,
        duration_minutes: i64,
        max_search_hours: i64,
    ) -> Result<Option<TimeSlot>, SchedulingError> {
        debug!(
            "Searching next free {}-minute slot for professional {} after {}",
            duration_minutes, professional_id, after
        );

        let search_end = after + Duration::hours(max_search_hours);
        let mut cursor = after;

        while cursor < search_end {
            let candidate = TimeSlot::new(cursor, cursor + Duration::minutes(duration_minutes))?;
            let conflicts = self
                .find_conflicts(ResourceRef::Professional(professional_id), candidate, None)
                .await?;
            if conflicts.is_empty() {
                return Ok(Some(candidate));
            }
            cursor += Duration::minutes(SLOT_SEARCH_STEP_MINUTES);
        }

        Ok(None)
    }
}
