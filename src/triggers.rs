//! Device trigger types and the signals derived from alarms.

use std::collections::HashSet;

use crate::payload::AlarmRecord;

/// Event type fired on the bus for every matched trigger.
pub const TRIGGER_EVENT: &str = "sleep_as_ha_event";

pub const ALARM_ENABLED: &str = "alarm_enabled";
pub const ALARM_DISABLED: &str = "alarm_disabled";
pub const ALARM_SUSPENDED: &str = "alarm_suspended";

/// Events Sleep as Android publishes, plus the derived alarm signals.
pub const DEFAULT_TRIGGERS: &[&str] = &[
    "sleep_tracking_started",
    "sleep_tracking_stopped",
    "sleep_tracking_paused",
    "sleep_tracking_resumed",
    "alarm_snooze_clicked",
    "alarm_snooze_canceled",
    "time_to_bed_alarm_alert",
    "alarm_alert_start",
    "alarm_alert_dismiss",
    "alarm_skip_next",
    "alarm_rescheduled",
    "show_skip_next_alarm",
    "before_alarm",
    "rem",
    "smart_period",
    "before_smart_period",
    "lullaby_start",
    "lullaby_stop",
    "lullaby_volume_down",
    "deep_sleep",
    "light_sleep",
    "awake",
    "not_awake",
    "apnea_alarm",
    "antisnoring",
    "sound_event_snore",
    "sound_event_talk",
    "sound_event_cough",
    "sound_event_baby",
    "sound_event_laugh",
    ALARM_ENABLED,
    ALARM_DISABLED,
    ALARM_SUSPENDED,
];

/// Configured trigger conditions.
#[derive(Debug, Clone)]
pub struct TriggerSet {
    types: HashSet<String>,
}

impl TriggerSet {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, trigger_type: &str) -> bool {
        self.types.contains(trigger_type)
    }
}

impl Default for TriggerSet {
    fn default() -> Self {
        Self::new(DEFAULT_TRIGGERS.iter().copied())
    }
}

/// Signal an alarm raises when a batch carrying it is applied.
/// A suspended alarm takes precedence over its enabled flag.
pub fn alarm_signal(alarm: &AlarmRecord) -> &'static str {
    if alarm.suspend_time.is_some() {
        ALARM_SUSPENDED
    } else if alarm.enabled {
        ALARM_ENABLED
    } else {
        ALARM_DISABLED
    }
}
