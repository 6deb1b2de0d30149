use std::env;
use tracing::warn;

/// Scheduling policy knobs loaded from the environment.
///
/// Every value has a working default so the core can run in tests and local
/// development without any configuration.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    pub min_cancellation_lead_hours: i64,
    pub min_duration_minutes: i64,
    pub max_duration_minutes: i64,
    pub max_advance_booking_days: i64,
    pub max_update_retries: u32,
}

impl Default for SchedulingConfig {
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

impl SchedulingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            min_cancellation_lead_hours: read_var(
                "SCHEDULING_MIN_CANCELLATION_LEAD_HOURS",
                defaults.min_cancellation_lead_hours,
            ),
            min_duration_minutes: read_var(
                "SCHEDULING_MIN_DURATION_MINUTES",
                defaults.min_duration_minutes,
            ),
            max_duration_minutes: read_var(
                "SCHEDULING_MAX_DURATION_MINUTES",
                defaults.max_duration_minutes,
            ),
            max_advance_booking_days: read_var(
                "SCHEDULING_MAX_ADVANCE_BOOKING_DAYS",
                defaults.max_advance_booking_days,
            ),
            max_update_retries: read_var("SCHEDULING_MAX_UPDATE_RETRIES", defaults.max_update_retries),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min_duration_minutes > 0
            && self.max_duration_minutes >= self.min_duration_minutes
            && self.min_cancellation_lead_hours >= 0
            && self.max_advance_booking_days > 0
    }
}

fn read_var<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has unparseable value {:?}, using default {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
