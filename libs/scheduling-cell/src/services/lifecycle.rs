// libs/scheduling-cell/src/services/lifecycle.rs
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{Appointment, AppointmentStatus, SchedulingError, SchedulingPolicy};

/// The authoritative lifecycle table. Every status change in the core goes
/// through `validate_transition`; no call site re-validates inline.
pub struct AppointmentLifecycleService;

impl Default for AppointmentLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_transition(
        &self,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<(), SchedulingError> {
        debug!("Validating status transition {} -> {}", from, to);

        if !self.valid_transitions(from).contains(&to) {
            warn!("Invalid status transition attempted: {} -> {}", from, to);
            return Err(SchedulingError::InvalidTransition { from, to });
        }

        Ok(())
    }

    /// All legal next statuses for a given current status.
    ///
    /// `Rescheduled` stays a legal target from pending/confirmed for
    /// integrations that supersede records, but the in-place reschedule path
    /// in this core never assigns it.
    pub fn valid_transitions(&self, from: AppointmentStatus) -> Vec<AppointmentStatus> {
        match from {
            AppointmentStatus::Pending => vec![
                AppointmentStatus::Confirmed,
                AppointmentStatus::InProgress,
                AppointmentStatus::Cancelled,
                AppointmentStatus::NoShow,
                AppointmentStatus::Rescheduled,
            ],
            AppointmentStatus::Confirmed => vec![
                AppointmentStatus::InProgress,
                AppointmentStatus::Cancelled,
                AppointmentStatus::NoShow,
                AppointmentStatus::Rescheduled,
            ],
            AppointmentStatus::InProgress => vec![AppointmentStatus::Completed],
            // Terminal states
            AppointmentStatus::Completed
            | AppointmentStatus::Cancelled
            | AppointmentStatus::NoShow
            | AppointmentStatus::Rescheduled => vec![],
        }
    }

    /// True iff the appointment is still pending/confirmed and at least the
    /// minimum lead time remains before its start.
    pub fn can_be_cancelled(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
        policy: &SchedulingPolicy,
    ) -> bool {
        matches!(
            appointment.status(),
            AppointmentStatus::Pending | AppointmentStatus::Confirmed
        ) && appointment.minutes_until_start(now) >= policy.min_cancellation_lead_hours * 60
    }

    /// Rescheduling follows the same lead-time rule as cancellation,
    /// measured against the current start time.
    pub fn can_be_rescheduled(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
        policy: &SchedulingPolicy,
    ) -> bool {
        self.can_be_cancelled(appointment, now, policy)
    }

    pub fn ensure_cancellable(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
        policy: &SchedulingPolicy,
    ) -> Result<(), SchedulingError> {
        self.validate_transition(appointment.status(), AppointmentStatus::Cancelled)?;

        let minutes_remaining = appointment.minutes_until_start(now);
        if minutes_remaining < policy.min_cancellation_lead_hours * 60 {
            return Err(SchedulingError::TooLateToCancel { minutes_remaining });
        }

        Ok(())
    }

    pub fn ensure_reschedulable(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
        policy: &SchedulingPolicy,
    ) -> Result<(), SchedulingError> {
        // A window change is only legal where the rescheduled edge is.
        self.validate_transition(appointment.status(), AppointmentStatus::Rescheduled)?;

        let minutes_remaining = appointment.minutes_until_start(now);
        if minutes_remaining < policy.min_cancellation_lead_hours * 60 {
            return Err(SchedulingError::TooLateToReschedule { minutes_remaining });
        }

        Ok(())
    }

    /// An appointment whose start has passed without a recorded arrival is
    /// eligible for no-show.
    pub fn should_mark_no_show(&self, appointment: &Appointment, now: DateTime<Utc>) -> bool {
        matches!(
            appointment.status(),
            AppointmentStatus::Pending | AppointmentStatus::Confirmed
        ) && appointment.attendance().arrived_at.is_none()
            && now > appointment.start_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::appointment;
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn service() -> AppointmentLifecycleService {
        AppointmentLifecycleService::new()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).single().expect("valid timestamp")
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let service = service();
        assert!(service
            .validate_transition(AppointmentStatus::Pending, AppointmentStatus::Confirmed)
            .is_ok());
        assert!(service
            .validate_transition(AppointmentStatus::Confirmed, AppointmentStatus::InProgress)
            .is_ok());
        assert!(service
            .validate_transition(AppointmentStatus::Pending, AppointmentStatus::InProgress)
            .is_ok());
        assert!(service
            .validate_transition(AppointmentStatus::InProgress, AppointmentStatus::Completed)
            .is_ok());
    }

    #[test]
    fn terminal_states_allow_nothing() {
        let service = service();
        for terminal in [
            AppointmentStatus::Completed,
            AppointmentStatus::Cancelled,
            AppointmentStatus::NoShow,
            AppointmentStatus::Rescheduled,
        ] {
            assert!(service.valid_transitions(terminal).is_empty());
        }
    }

    #[test]
    fn completed_cannot_be_reopened() {
        let err = service()
            .validate_transition(AppointmentStatus::Completed, AppointmentStatus::Pending)
            .unwrap_err();
        assert_matches!(
            err,
            SchedulingError::InvalidTransition {
                from: AppointmentStatus::Completed,
                to: AppointmentStatus::Pending,
            }
        );
    }

    #[test]
    fn in_progress_cannot_be_cancelled() {
        let err = service()
            .validate_transition(AppointmentStatus::InProgress, AppointmentStatus::Cancelled)
            .unwrap_err();
        assert_matches!(err, SchedulingError::InvalidTransition { .. });
    }

    #[test]
    fn lead_time_boundary_is_deterministic() {
        let service = service();
        let policy = SchedulingPolicy::default();
        let start = at(12, 0);
        let appt = appointment(Uuid::new_v4(), None, start, at(13, 0), AppointmentStatus::Confirmed);

        // 121 minutes out: allowed.
        assert!(service.can_be_cancelled(&appt, start - Duration::minutes(121), &policy));
        // Exactly 120 minutes out: allowed.
        assert!(service.can_be_cancelled(&appt, start - Duration::minutes(120), &policy));
        // 119 minutes out: rejected.
        assert!(!service.can_be_cancelled(&appt, start - Duration::minutes(119), &policy));

        let err = service
            .ensure_cancellable(&appt, start - Duration::minutes(119), &policy)
            .unwrap_err();
        assert_matches!(err, SchedulingError::TooLateToCancel { minutes_remaining: 119 });
    }

    #[test]
    fn reschedule_lead_time_uses_current_start() {
        let service = service();
        let policy = SchedulingPolicy::default();
        let start = at(12, 0);
        let appt = appointment(Uuid::new_v4(), None, start, at(13, 0), AppointmentStatus::Pending);

        assert!(service.ensure_reschedulable(&appt, start - Duration::hours(3), &policy).is_ok());
        let err = service
            .ensure_reschedulable(&appt, start - Duration::minutes(60), &policy)
            .unwrap_err();
        assert_matches!(err, SchedulingError::TooLateToReschedule { minutes_remaining: 60 });
    }

    #[test]
    fn no_show_requires_missed_start_without_arrival() {
        let service = service();
        let start = at(10, 0);
        let appt = appointment(Uuid::new_v4(), None, start, at(11, 0), AppointmentStatus::Confirmed);

        assert!(!service.should_mark_no_show(&appt, start - Duration::minutes(5)));
        assert!(service.should_mark_no_show(&appt, start + Duration::minutes(10)));

        let mut arrived = appt.clone();
        arrived.attendance.arrived_at = Some(start - Duration::minutes(2));
        assert!(!service.should_mark_no_show(&arrived, start + Duration::minutes(10)));
    }
}
