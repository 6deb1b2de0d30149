// libs/scheduling-cell/src/services/attendance.rs
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{Appointment, AppointmentStatus, ReminderChannel, SchedulingError};
use crate::services::lifecycle::AppointmentLifecycleService;

/// Records arrival and session timestamps on an appointment and keeps the
/// per-channel reminder flags. Attendance timestamps must stay monotonic:
/// arrival <= session start <= session end.
pub struct AttendanceTrackingService {
    lifecycle: AppointmentLifecycleService,
}

impl Default for AttendanceTrackingService {
    fn default() -> Self {
        Self::new()
    }
}

impl AttendanceTrackingService {
    pub fn new() -> Self {
        Self {
            lifecycle: AppointmentLifecycleService::new(),
        }
    }

    pub fn mark_arrived(
        &self,
        appointment: &mut Appointment,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        if appointment.status().is_terminal() {
            return Err(SchedulingError::InvalidAttendanceOrder(format!(
                "cannot record arrival on a {} appointment",
                appointment.status()
            )));
        }
        if appointment.attendance.session_started_at.is_some() {
            return Err(SchedulingError::InvalidAttendanceOrder(
                "arrival must be recorded before the session starts".to_string(),
            ));
        }

        appointment.attendance.arrived_at = Some(now);
        debug!("Arrival recorded for appointment {}", appointment.id);
        Ok(())
    }

    pub fn start_session(
        &self,
        appointment: &mut Appointment,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        self.lifecycle
            .validate_transition(appointment.status(), AppointmentStatus::InProgress)?;

        if let Some(arrived_at) = appointment.attendance.arrived_at {
            if now < arrived_at {
                return Err(SchedulingError::InvalidAttendanceOrder(
                    "session start precedes recorded arrival".to_string(),
                ));
            }
        }

        appointment.attendance.session_started_at = Some(now);
        appointment.status = AppointmentStatus::InProgress;
        debug!("Session started for appointment {}", appointment.id);
        Ok(())
    }

    /// Ends the session and computes the actual duration in whole minutes.
    pub fn end_session(
        &self,
        appointment: &mut Appointment,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        let started_at = appointment.attendance.session_started_at.ok_or_else(|| {
            SchedulingError::InvalidAttendanceOrder(
                "session cannot end before it has started".to_string(),
            )
        })?;
        if now < started_at {
            return Err(SchedulingError::InvalidAttendanceOrder(
                "session end precedes session start".to_string(),
            ));
        }

        self.lifecycle
            .validate_transition(appointment.status(), AppointmentStatus::Completed)?;

        appointment.attendance.session_ended_at = Some(now);
        appointment.attendance.actual_duration_minutes = Some((now - started_at).num_minutes());
        appointment.status = AppointmentStatus::Completed;
        debug!("Session completed for appointment {}", appointment.id);
        Ok(())
    }

    /// Flips every reminder flag back to "not sent". Invoked on every window
    /// change.
    pub fn reset_reminders(&self, appointment: &mut Appointment) {
        appointment.reminders.reset();
    }

    pub fn record_reminder_sent(
        &self,
        appointment: &mut Appointment,
        channel: ReminderChannel,
    ) -> Result<(), SchedulingError> {
        if appointment.status().is_terminal() {
            return Err(SchedulingError::ValidationError(format!(
                "cannot record a reminder on a {} appointment",
                appointment.status()
            )));
        }
        appointment.reminders.mark_sent(channel);
        Ok(())
    }
}
