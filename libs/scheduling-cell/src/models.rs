// libs/scheduling-cell/src/models.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use shared_config::SchedulingConfig;

// ==============================================================================
// TIME SLOT
// ==============================================================================

/// Half-open time range `[start, end)` in absolute UTC time.
///
/// All overlap arithmetic happens on these instants; the timezone stored on
/// an appointment is display-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl TimeSlot {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Result<Self, SchedulingError> {
        if end_time <= start_time {
            return Err(SchedulingError::InvalidInterval(format!(
                "end time {} must be after start time {}",
                end_time, start_time
            )));
        }
        Ok(Self { start_time, end_time })
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes()
    }

    /// Two slots overlap iff `start < other.end && other.start < end`.
    /// A slot ending exactly when another begins does not overlap.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }

    /// The slot widened by `minutes` on both sides, used for buffer probes.
    pub fn widened_by(&self, minutes: i64) -> TimeSlot {
        TimeSlot {
            start_time: self.start_time - Duration::minutes(minutes),
            end_time: self.end_time + Duration::minutes(minutes),
        }
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {})", self.start_time, self.end_time)
    }
}

// ==============================================================================
// STATUS AND LIFECYCLE ENUMS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl AppointmentStatus {
    /// Whether an appointment in this status occupies its resources'
    /// calendars. Cancelled and no-show bookings free the slot.
    pub fn blocks_schedule(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed
                | AppointmentStatus::Cancelled
                | AppointmentStatus::NoShow
                | AppointmentStatus::Rescheduled
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Pending => write!(f, "pending"),
            AppointmentStatus::Confirmed => write!(f, "confirmed"),
            AppointmentStatus::InProgress => write!(f, "in_progress"),
            AppointmentStatus::Completed => write!(f, "completed"),
            AppointmentStatus::Cancelled => write!(f, "cancelled"),
            AppointmentStatus::NoShow => write!(f, "no_show"),
            AppointmentStatus::Rescheduled => write!(f, "rescheduled"),
        }
    }
}

/// How the booking entered the system. Affects only the initial status:
/// admin bookings land confirmed, every other channel starts pending.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingSource {
    Admin,
    Public,
    Professional,
    PatientPortal,
}

impl BookingSource {
    pub fn initial_status(&self) -> AppointmentStatus {
        match self {
            BookingSource::Admin => AppointmentStatus::Confirmed,
            _ => AppointmentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    Patient,
    Professional,
    Admin,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderChannel {
    Sms,
    Email,
    Push,
}

/// A resource whose calendar must stay free of double bookings. The
/// professional and room invariants are checked independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRef {
    Professional(Uuid),
    Room(Uuid),
}

impl ResourceRef {
    pub fn id(&self) -> Uuid {
        match self {
            ResourceRef::Professional(id) | ResourceRef::Room(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceRef::Professional(_) => "professional",
            ResourceRef::Room(_) => "room",
        }
    }
}

// ==============================================================================
// EMBEDDED RECORDS
// ==============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub arrived_at: Option<DateTime<Utc>>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_ended_at: Option<DateTime<Utc>>,
    pub actual_duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub cancelled_by: CancelledBy,
    pub cancelled_by_id: Uuid,
    pub cancelled_at: DateTime<Utc>,
    pub reason: String,
    pub refund_issued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReschedulingRecord {
    /// Every window the appointment held before the current one, oldest first.
    pub previous_windows: Vec<TimeSlot>,
    pub last_rescheduled_by: Uuid,
    pub last_reason: Option<String>,
    /// Only ever increments, never resets.
    pub rescheduling_count: u32,
}

/// Per-channel "reminder sent" flags. All flags reset whenever the
/// appointment window changes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderFlags {
    pub sms_sent: bool,
    pub email_sent: bool,
    pub push_sent: bool,
}

impl ReminderFlags {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn mark_sent(&mut self, channel: ReminderChannel) {
        match channel {
            ReminderChannel::Sms => self.sms_sent = true,
            ReminderChannel::Email => self.email_sent = true,
            ReminderChannel::Push => self.push_sent = true,
        }
    }

    pub fn is_sent(&self, channel: ReminderChannel) -> bool {
        match channel {
            ReminderChannel::Sms => self.sms_sent,
            ReminderChannel::Email => self.email_sent,
            ReminderChannel::Push => self.push_sent,
        }
    }

    pub fn any_sent(&self) -> bool {
        self.sms_sent || self.email_sent || self.push_sent
    }
}

// ==============================================================================
// APPOINTMENT
// ==============================================================================

/// The central entity. Status, the time window, and the embedded records are
/// crate-private: outside this crate they change only through the lifecycle
/// operations, never by direct field assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub service_id: Uuid,
    pub room_id: Option<Uuid>,
    pub(crate) slot: TimeSlot,
    pub timezone: String,
    pub(crate) status: AppointmentStatus,
    pub source: BookingSource,
    pub(crate) attendance: AttendanceRecord,
    pub(crate) cancellation: Option<CancellationRecord>,
    pub(crate) rescheduling: Option<ReschedulingRecord>,
    pub(crate) reminders: ReminderFlags,
    pub(crate) deleted_at: Option<DateTime<Utc>>,
    pub(crate) version: i64,
    pub created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Appointment {
    pub(crate) fn new(request: &BookAppointmentRequest, slot: TimeSlot, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            professional_id: request.professional_id,
            service_id: request.service_id,
            room_id: request.room_id,
            slot,
            timezone: request.timezone.clone(),
            status: request.source.initial_status(),
            source: request.source,
            attendance: AttendanceRecord::default(),
            cancellation: None,
            rescheduling: None,
            reminders: ReminderFlags::default(),
            deleted_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn slot(&self) -> TimeSlot {
        self.slot
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.slot.start_time()
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.slot.end_time()
    }

    pub fn duration_minutes(&self) -> i64 {
        self.slot.duration_minutes()
    }

    pub fn status(&self) -> AppointmentStatus {
        self.status
    }

    pub fn attendance(&self) -> &AttendanceRecord {
        &self.attendance
    }

    pub fn cancellation(&self) -> Option<&CancellationRecord> {
        self.cancellation.as_ref()
    }

    pub fn rescheduling(&self) -> Option<&ReschedulingRecord> {
        self.rescheduling.as_ref()
    }

    pub fn rescheduling_count(&self) -> u32 {
        self.rescheduling.as_ref().map(|r| r.rescheduling_count).unwrap_or(0)
    }

    pub fn reminders(&self) -> ReminderFlags {
        self.reminders
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whole minutes between `now` and the scheduled start. Negative once
    /// the start has passed.
    pub fn minutes_until_start(&self, now: DateTime<Utc>) -> i64 {
        (self.slot.start_time() - now).num_minutes()
    }

    pub fn occupies(&self, resource: ResourceRef) -> bool {
        match resource {
            ResourceRef::Professional(id) => self.professional_id == id,
            ResourceRef::Room(id) => self.room_id == Some(id),
        }
    }
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub service_id: Uuid,
    pub room_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub timezone: String,
    pub source: BookingSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub cancelled_by: CancelledBy,
    pub cancelled_by_id: Uuid,
    pub reason: String,
    pub refund_issued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleAppointmentRequest {
    pub new_start_time: DateTime<Utc>,
    /// Defaults to preserving the current duration.
    pub new_end_time: Option<DateTime<Utc>>,
    pub rescheduled_by: Uuid,
    pub reason: Option<String>,
}

/// A colliding booking, reported as data so callers can propose
/// alternatives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictingSlot {
    pub appointment_id: Uuid,
    pub slot: TimeSlot,
    pub status: AppointmentStatus,
}

// ==============================================================================
// POLICY
// ==============================================================================

#[derive(Debug, Clone)]
pub struct SchedulingPolicy {
    pub min_cancellation_lead_hours: i64,
    pub min_duration_minutes: i64,
    pub max_duration_minutes: i64,
    pub max_advance_booking_days: i64,
    pub max_update_retries: u32,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            min_cancellation_lead_hours: 2,
            min_duration_minutes: 15,
            max_duration_minutes: 240,
            max_advance_booking_days: 90,
            max_update_retries: 3,
        }
    }
}

impl From<&SchedulingConfig> for SchedulingPolicy {
    fn from(config: &SchedulingConfig) -> Self {
        Self {
            min_cancellation_lead_hours: config.min_cancellation_lead_hours,
            min_duration_minutes: config.min_duration_minutes,
            max_duration_minutes: config.max_duration_minutes,
            max_advance_booking_days: config.max_advance_booking_days,
            max_update_retries: config.max_update_retries,
        }
    }
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum SchedulingError {
    #[error("Appointment not found")]
    NotFound,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Requested slot conflicts with {} existing booking(s)", conflicts.len())]
    ConflictDetected { conflicts: Vec<ConflictingSlot> },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Too late to cancel: {minutes_remaining} minutes before start")]
    TooLateToCancel { minutes_remaining: i64 },

    #[error("Too late to reschedule: {minutes_remaining} minutes before start")]
    TooLateToReschedule { minutes_remaining: i64 },

    #[error("Invalid attendance order: {0}")]
    InvalidAttendanceOrder(String),

    #[error("Concurrent modification detected, retry the operation")]
    VersionConflict,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}

// ==============================================================================
// TESTS
// ==============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).single().expect("valid timestamp")
    }

    #[test]
    fn rejects_non_positive_duration() {
        assert!(TimeSlot::new(at(10, 0), at(10, 0)).is_err());
        assert!(TimeSlot::new(at(10, 0), at(9, 0)).is_err());
        assert!(TimeSlot::new(at(10, 0), at(11, 0)).is_ok());
    }

    #[test]
    fn overlap_is_half_open() {
        let morning = TimeSlot::new(at(10, 0), at(11, 0)).unwrap();
        let overlapping = TimeSlot::new(at(10, 30), at(11, 30)).unwrap();
        let adjacent = TimeSlot::new(at(11, 0), at(12, 0)).unwrap();
        let contained = TimeSlot::new(at(10, 15), at(10, 45)).unwrap();

        assert!(morning.overlaps(&overlapping));
        assert!(overlapping.overlaps(&morning));
        assert!(morning.overlaps(&contained));
        assert!(!morning.overlaps(&adjacent));
        assert!(!adjacent.overlaps(&morning));
    }

    #[test]
    fn duration_in_minutes() {
        let slot = TimeSlot::new(at(9, 0), at(10, 30)).unwrap();
        assert_eq!(slot.duration_minutes(), 90);
    }

    #[test]
    fn status_display_matches_wire_format() {
        assert_eq!(AppointmentStatus::InProgress.to_string(), "in_progress");
        assert_eq!(AppointmentStatus::NoShow.to_string(), "no_show");
        let json = serde_json::to_string(&AppointmentStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn admin_bookings_start_confirmed() {
        assert_eq!(BookingSource::Admin.initial_status(), AppointmentStatus::Confirmed);
        assert_eq!(BookingSource::Public.initial_status(), AppointmentStatus::Pending);
        assert_eq!(BookingSource::PatientPortal.initial_status(), AppointmentStatus::Pending);
    }

    #[test]
    fn reminder_flags_reset_clears_all_channels() {
        let mut flags = ReminderFlags::default();
        flags.mark_sent(ReminderChannel::Email);
        flags.mark_sent(ReminderChannel::Sms);
        assert!(flags.any_sent());
        assert!(flags.is_sent(ReminderChannel::Email));

        flags.reset();
        assert!(!flags.any_sent());
        assert!(!flags.is_sent(ReminderChannel::Sms));
    }

    #[test]
    fn policy_mirrors_environment_config() {
        let config = SchedulingConfig::default();
        let policy = SchedulingPolicy::from(&config);
        assert_eq!(policy.min_cancellation_lead_hours, config.min_cancellation_lead_hours);
        assert_eq!(policy.max_duration_minutes, config.max_duration_minutes);
        assert_eq!(policy.max_update_retries, config.max_update_retries);
    }

    #[test]
    fn cancelled_and_no_show_release_the_slot() {
        assert!(AppointmentStatus::Pending.blocks_schedule());
        assert!(AppointmentStatus::Completed.blocks_schedule());
        assert!(!AppointmentStatus::Cancelled.blocks_schedule());
        assert!(!AppointmentStatus::NoShow.blocks_schedule());
    }
}
