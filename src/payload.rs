//! Decoding of the two payload kinds Sleep as Android publishes.
//!
//! - `<topic>` carries a flat JSON object describing the tracker state:
//!   `{"event": "sleep_tracking_started", "value1": "1698765432000", ...}`
//! - `<topic>/alarms` carries a JSON array of alarm objects with a nested
//!   repeat schedule and an optional extended config.
//!
//! Everything is validated here so the dispatcher only ever sees closed,
//! typed records.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::modes::{
    Captcha, DelayedStart, Mode, RepeatKind, SentinelKind, SnoozeAfterAlarm, SnoozeDuration,
    SnoozeLimit, Vibrate, VolumeIncrease,
};

/// Coarse classification of a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The bytes are not JSON at all.
    MalformedPayload,
    /// Valid JSON that does not fit the expected record.
    SchemaViolation,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload does not match the expected shape: {0}")]
    Shape(#[source] serde_json::Error),
    #[error("expected a JSON {expected}, got {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("field `{field}` must be a scalar value")]
    NotScalar { field: String },
    #[error("field `{field}` value {value} is out of range")]
    OutOfRange { field: String, value: i64 },
    #[error("field `{field}` holds unrecognized value {value}")]
    UnknownMode { field: String, value: i64 },
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::Malformed(_) => ErrorKind::MalformedPayload,
            _ => ErrorKind::SchemaViolation,
        }
    }
}

// ── Sleep tracker state ──────────────────────────────────

/// One scalar member of a state payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&StateValue> for Value {
    fn from(value: &StateValue) -> Self {
        match value {
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::Integer(n) => Value::from(*n),
            StateValue::Float(f) => Value::from(*f),
            StateValue::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Decoded tracker state. The `event` member is always present and textual.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SleepStateRecord {
    fields: BTreeMap<String, StateValue>,
}

impl SleepStateRecord {
    /// The event name, i.e. the tracker's primary state.
    pub fn event(&self) -> &str {
        match self.fields.get("event") {
            Some(StateValue::Text(event)) => event,
            _ => "",
        }
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.fields.get(key)
    }
}

/// Decode a tracker state payload. `null` members count as absent.
pub fn decode_state(bytes: &[u8]) -> Result<SleepStateRecord, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let object = match value {
        Value::Object(map) => map,
        other => {
            return Err(DecodeError::UnexpectedType {
                expected: "object",
                found: json_type(&other),
            })
        }
    };

    let mut fields = BTreeMap::new();
    for (key, value) in object {
        let decoded = match value {
            Value::Null => continue,
            Value::Bool(b) => StateValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => StateValue::Integer(i),
                None => StateValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => StateValue::Text(s),
            Value::Array(_) | Value::Object(_) => return Err(DecodeError::NotScalar { field: key }),
        };
        fields.insert(key, decoded);
    }

    match fields.get("event") {
        Some(StateValue::Text(_)) => Ok(SleepStateRecord { fields }),
        Some(_) => Err(DecodeError::NotScalar {
            field: "event".to_string(),
        }),
        None => Err(DecodeError::MissingField("event".to_string())),
    }
}

// ── Alarms ───────────────────────────────────────────────

/// Which days a weekly-style alarm rings on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DaysOfWeek {
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
}

impl DaysOfWeek {
    /// bit0 = Monday … bit6 = Sunday.
    pub fn from_mask(mask: u8) -> Self {
        let bit = |n: u8| mask & (1 << n) != 0;
        Self {
            monday: bit(0),
            tuesday: bit(1),
            wednesday: bit(2),
            thursday: bit(3),
            friday: bit(4),
            saturday: bit(5),
            sunday: bit(6),
        }
    }
}

/// Recurrence rule of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatSchedule {
    /// No repeat, weekly, odd-week or even-week, on the flagged days.
    Days { kind: RepeatKind, days: DaysOfWeek },
    /// Every `times` days counted from `start_from`.
    NonWeekly {
        times: u32,
        start_from: Option<DateTime<Utc>>,
    },
}

impl RepeatSchedule {
    pub fn kind(&self) -> RepeatKind {
        match self {
            RepeatSchedule::Days { kind, .. } => *kind,
            RepeatSchedule::NonWeekly { .. } => RepeatKind::NonWeekly,
        }
    }

    pub fn start_from(&self) -> Option<DateTime<Utc>> {
        match self {
            RepeatSchedule::Days { .. } => None,
            RepeatSchedule::NonWeekly { start_from, .. } => *start_from,
        }
    }
}

impl Serialize for RepeatSchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("RepeatSchedule", 3)?;
        out.serialize_field("value", self.kind().name())?;
        match self {
            RepeatSchedule::Days { days, .. } => out.serialize_field("times", days)?,
            RepeatSchedule::NonWeekly { times, .. } => out.serialize_field("times", times)?,
        }
        out.serialize_field("start_from", &self.start_from())?;
        out.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snooze {
    pub after_alarm: SnoozeAfterAlarm,
    pub duration: SnoozeDuration,
    pub limit: SnoozeLimit,
    pub total_time_limit: SnoozeDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtendedConfig {
    pub volume_increase: VolumeIncrease,
    pub snooze: Snooze,
    pub delayed_start: DelayedStart,
    pub self_disposable: bool,
    pub terminate_tracking: bool,
    pub vibration: Vibrate,
    pub vibration_wearable: Vibrate,
    pub last_enabled: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRecord {
    pub id: i64,
    pub hour: u8,
    #[serde(rename = "minutes")]
    pub minute: u8,
    #[serde(rename = "days_of_week")]
    pub repeat: RepeatSchedule,
    pub label: Option<String>,
    pub enabled: bool,
    pub silent: bool,
    pub vibrate: bool,
    pub captcha: Option<Captcha>,
    pub alert: Option<String>,
    pub extended_config: Option<ExtendedConfig>,
    pub suspend_time: Option<DateTime<Utc>>,
    pub time: Option<DateTime<Utc>>,
}

/// Result of decoding an alarm array: the good records plus what was skipped.
#[derive(Debug, Default)]
pub struct AlarmBatch {
    pub records: Vec<AlarmRecord>,
    pub rejected: Vec<(usize, DecodeError)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAlarm {
    #[serde(default = "default_alarm_id")]
    id: i64,
    hour: Option<i64>,
    minutes: Option<i64>,
    days_of_week: Option<RawRepeat>,
    label: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    silent: bool,
    #[serde(default = "default_true")]
    legacy_vibrate: bool,
    captcha: Option<i64>,
    alert: Option<String>,
    extended_config: Option<RawExtendedConfig>,
    suspend_time: Option<i64>,
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRepeat {
    week_repeat: Option<i64>,
    days: Option<i64>,
    non_weekly_repeat: Option<i64>,
    non_weekly_from: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExtendedConfig {
    gradual_volume_increase: Option<i64>,
    snooze_after_alarm: Option<i64>,
    snooze_duration: Option<i64>,
    snooze_limit: Option<i64>,
    snooze_total_time_limit: Option<i64>,
    sound_delay: Option<i64>,
    is_self_disposable: Option<bool>,
    terminates_tracking: Option<bool>,
    vibration_start: Option<i64>,
    vibration_start_smart_watch: Option<i64>,
    last_enable_timestamp: Option<i64>,
}

fn default_alarm_id() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

/// Decode an alarm array. A bad element is logged and skipped; its siblings
/// still decode. Only a body that is not a JSON array fails as a whole.
pub fn decode_alarms(bytes: &[u8]) -> Result<AlarmBatch, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let elements = match value {
        Value::Array(elements) => elements,
        other => {
            return Err(DecodeError::UnexpectedType {
                expected: "array",
                found: json_type(&other),
            })
        }
    };

    let mut batch = AlarmBatch::default();
    for (index, element) in elements.iter().enumerate() {
        match decode_alarm(element) {
            Ok(record) => batch.records.push(record),
            Err(e) => {
                tracing::warn!("Skipping alarm #{} in payload: {}", index, e);
                batch.rejected.push((index, e));
            }
        }
    }
    Ok(batch)
}

/// Decode a single alarm object.
pub fn decode_alarm(value: &Value) -> Result<AlarmRecord, DecodeError> {
    let raw = RawAlarm::deserialize(value).map_err(DecodeError::Shape)?;

    let hour = bounded("hour", required(raw.hour, "hour")?, 23)?;
    let minute = bounded("minutes", required(raw.minutes, "minutes")?, 59)?;
    let repeat = decode_repeat(required(raw.days_of_week, "daysOfWeek")?)?;
    let captcha = raw
        .captcha
        .map(|code| Captcha::decode("captcha", code))
        .transpose()?;
    let extended_config = raw.extended_config.map(decode_extended).transpose()?;

    Ok(AlarmRecord {
        id: raw.id,
        hour,
        minute,
        repeat,
        label: raw.label,
        enabled: raw.enabled,
        silent: raw.silent,
        vibrate: raw.legacy_vibrate,
        captcha,
        alert: raw.alert,
        extended_config,
        suspend_time: raw.suspend_time.and_then(instant_from_millis),
        time: raw.time.and_then(instant_from_millis),
    })
}

fn decode_repeat(raw: RawRepeat) -> Result<RepeatSchedule, DecodeError> {
    let code = required(raw.week_repeat, "daysOfWeek.weekRepeat")?;
    let kind = RepeatKind::from_code(code).ok_or_else(|| DecodeError::UnknownMode {
        field: "daysOfWeek.weekRepeat".to_string(),
        value: code,
    })?;

    if kind == RepeatKind::NonWeekly {
        let times = required(raw.non_weekly_repeat, "daysOfWeek.nonWeeklyRepeat")?;
        let times = u32::try_from(times).map_err(|_| DecodeError::OutOfRange {
            field: "daysOfWeek.nonWeeklyRepeat".to_string(),
            value: times,
        })?;
        let start_from = required(raw.non_weekly_from, "daysOfWeek.nonWeeklyFrom")?;
        return Ok(RepeatSchedule::NonWeekly {
            times,
            start_from: instant_from_millis(start_from),
        });
    }

    let mask = required(raw.days, "daysOfWeek.days")?;
    let mask = u8::try_from(mask)
        .ok()
        .filter(|m| *m <= 0x7f)
        .ok_or_else(|| DecodeError::OutOfRange {
            field: "daysOfWeek.days".to_string(),
            value: mask,
        })?;
    Ok(RepeatSchedule::Days {
        kind,
        days: DaysOfWeek::from_mask(mask),
    })
}

fn decode_extended(raw: RawExtendedConfig) -> Result<ExtendedConfig, DecodeError> {
    fn mode<S: SentinelKind>(field: &str, value: Option<i64>) -> Result<Mode<S>, DecodeError> {
        let code = required(value, field)?;
        Mode::decode(field, code)
    }

    Ok(ExtendedConfig {
        volume_increase: mode("extendedConfig.gradualVolumeIncrease", raw.gradual_volume_increase)?,
        snooze: Snooze {
            after_alarm: mode("extendedConfig.snoozeAfterAlarm", raw.snooze_after_alarm)?,
            duration: mode("extendedConfig.snoozeDuration", raw.snooze_duration)?,
            limit: mode("extendedConfig.snoozeLimit", raw.snooze_limit)?,
            total_time_limit: mode(
                "extendedConfig.snoozeTotalTimeLimit",
                raw.snooze_total_time_limit,
            )?,
        },
        delayed_start: mode("extendedConfig.soundDelay", raw.sound_delay)?,
        self_disposable: required(raw.is_self_disposable, "extendedConfig.isSelfDisposable")?,
        terminate_tracking: required(raw.terminates_tracking, "extendedConfig.terminatesTracking")?,
        vibration: mode("extendedConfig.vibrationStart", raw.vibration_start)?,
        vibration_wearable: mode(
            "extendedConfig.vibrationStartSmartWatch",
            raw.vibration_start_smart_watch,
        )?,
        last_enabled: required(raw.last_enable_timestamp, "extendedConfig.lastEnableTimestamp")
            .map(instant_from_millis)?,
    })
}

/// Epoch milliseconds to an instant; zero and negative values mean "unset".
pub fn instant_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, DecodeError> {
    value.ok_or_else(|| DecodeError::MissingField(field.to_string()))
}

fn bounded(field: &str, value: i64, max: u8) -> Result<u8, DecodeError> {
    u8::try_from(value)
        .ok()
        .filter(|v| *v <= max)
        .ok_or_else(|| DecodeError::OutOfRange {
            field: field.to_string(),
            value,
        })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::{CaptchaKind, SnoozeLimitKind, VibrateKind, VolumeIncreaseKind};
    use serde_json::json;

    fn to_bytes(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    fn full_extended_config() -> Value {
        json!({
            "gradualVolumeIncrease": 60,
            "snoozeAfterAlarm": 1,
            "snoozeDuration": -1,
            "snoozeLimit": 3,
            "snoozeTotalTimeLimit": 30,
            "soundDelay": -1,
            "isSelfDisposable": false,
            "terminatesTracking": true,
            "vibrationStart": 0,
            "vibrationStartSmartWatch": -2,
            "lastEnableTimestamp": 1700000000000i64
        })
    }

    #[test]
    fn test_decode_state_flat_object() {
        let record = decode_state(
            br#"{"event":"sleep_tracking_started","value1":"1700000000000","value2":3,"value3":null}"#,
        )
        .unwrap();
        assert_eq!(record.event(), "sleep_tracking_started");
        assert_eq!(
            record.get("value1"),
            Some(&StateValue::Text("1700000000000".to_string()))
        );
        assert_eq!(record.get("value2"), Some(&StateValue::Integer(3)));
        assert_eq!(record.get("value3"), None);
    }

    #[test]
    fn test_decode_state_malformed() {
        let err = decode_state(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
    }

    #[test]
    fn test_decode_state_schema_violations() {
        let err = decode_state(br#"["event"]"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);

        let err = decode_state(br#"{"value1":"x"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField(ref f) if f == "event"));

        let err = decode_state(br#"{"event":"awake","value1":{"nested":true}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::NotScalar { ref field } if field == "value1"));
    }

    #[test]
    fn test_state_record_serializes_flat() {
        let record = decode_state(br#"{"event":"rem","value1":1.5}"#).unwrap();
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"event": "rem", "value1": 1.5})
        );
    }

    #[test]
    fn test_single_alarm_every_day() {
        let batch = decode_alarms(
            br#"[{"id":1,"hour":7,"minutes":30,"daysOfWeek":{"weekRepeat":0,"days":127}}]"#,
        )
        .unwrap();
        assert!(batch.rejected.is_empty());
        assert_eq!(batch.records.len(), 1);

        let alarm = &batch.records[0];
        assert_eq!(alarm.id, 1);
        assert_eq!(alarm.hour, 7);
        assert_eq!(alarm.minute, 30);
        match alarm.repeat {
            RepeatSchedule::Days { kind, days } => {
                assert_eq!(kind, RepeatKind::Weekly);
                assert_eq!(
                    days,
                    DaysOfWeek {
                        monday: true,
                        tuesday: true,
                        wednesday: true,
                        thursday: true,
                        friday: true,
                        saturday: true,
                        sunday: true,
                    }
                );
            }
            other => panic!("unexpected schedule {:?}", other),
        }
        // Defaults for absent optional fields
        assert!(alarm.enabled);
        assert!(!alarm.silent);
        assert!(alarm.vibrate);
        assert_eq!(alarm.label, None);
        assert_eq!(alarm.suspend_time, None);
    }

    #[test]
    fn test_days_mask_monday_wednesday() {
        let alarm = decode_alarm(&json!({
            "hour": 6, "minutes": 0,
            "daysOfWeek": {"weekRepeat": 0, "days": 0x05}
        }))
        .unwrap();
        let RepeatSchedule::Days { days, .. } = alarm.repeat else {
            panic!("expected a day schedule");
        };
        assert_eq!(
            days,
            DaysOfWeek {
                monday: true,
                wednesday: true,
                ..DaysOfWeek::default()
            }
        );
    }

    #[test]
    fn test_non_weekly_schedule() {
        let start = 1_700_000_000_123i64;
        let alarm = decode_alarm(&json!({
            "id": 9, "hour": 5, "minutes": 45,
            "daysOfWeek": {"weekRepeat": 3, "nonWeeklyRepeat": 5, "nonWeeklyFrom": start}
        }))
        .unwrap();

        let expected = Utc.timestamp_millis_opt(start).single();
        assert_eq!(
            alarm.repeat,
            RepeatSchedule::NonWeekly {
                times: 5,
                start_from: expected
            }
        );

        let serialized = serde_json::to_value(alarm.repeat).unwrap();
        assert_eq!(serialized["value"], "NON_WEEKLY");
        assert_eq!(serialized["times"], 5);
        assert!(serialized["start_from"].is_string());
    }

    #[test]
    fn test_weekly_schedule_serialization() {
        let schedule = RepeatSchedule::Days {
            kind: RepeatKind::OddWeek,
            days: DaysOfWeek::from_mask(0x40),
        };
        let serialized = serde_json::to_value(schedule).unwrap();
        assert_eq!(serialized["value"], "ODD_WEEK");
        assert_eq!(serialized["times"]["sunday"], true);
        assert_eq!(serialized["times"]["monday"], false);
        assert_eq!(serialized["start_from"], Value::Null);
    }

    #[test]
    fn test_unset_timestamps() {
        assert_eq!(instant_from_millis(-1), None);
        assert_eq!(instant_from_millis(0), None);
        assert!(instant_from_millis(1).is_some());

        let alarm = decode_alarm(&json!({
            "hour": 6, "minutes": 0, "suspendTime": -1, "time": 0,
            "daysOfWeek": {"weekRepeat": -1, "days": 0}
        }))
        .unwrap();
        assert_eq!(alarm.suspend_time, None);
        assert_eq!(alarm.time, None);
        assert_eq!(alarm.repeat.kind(), RepeatKind::NoRepeat);
    }

    #[test]
    fn test_extended_config() {
        let alarm = decode_alarm(&json!({
            "id": 4, "hour": 6, "minutes": 15, "captcha": 5, "label": "work",
            "daysOfWeek": {"weekRepeat": 2, "days": 31},
            "extendedConfig": full_extended_config()
        }))
        .unwrap();

        assert_eq!(alarm.captcha, Some(Mode::Sentinel(CaptchaKind::NfcTag)));
        let ext = alarm.extended_config.unwrap();
        assert_eq!(ext.volume_increase, Mode::Literal(60));
        assert_eq!(ext.snooze.limit, Mode::Literal(3));
        assert_eq!(ext.snooze.total_time_limit, Mode::Literal(30));
        assert_eq!(ext.vibration, Mode::Sentinel(VibrateKind::FromStart));
        assert_eq!(ext.vibration_wearable, Mode::Sentinel(VibrateKind::Default));
        assert!(ext.terminate_tracking);
        assert!(!ext.self_disposable);
        assert!(ext.last_enabled.is_some());
    }

    #[test]
    fn test_extended_config_sentinels() {
        let mut config = full_extended_config();
        config["gradualVolumeIncrease"] = json!(-1);
        config["snoozeLimit"] = json!(0);
        let alarm = decode_alarm(&json!({
            "hour": 6, "minutes": 15,
            "daysOfWeek": {"weekRepeat": 0, "days": 1},
            "extendedConfig": config
        }))
        .unwrap();
        let ext = alarm.extended_config.unwrap();
        assert_eq!(
            ext.volume_increase,
            Mode::Sentinel(VolumeIncreaseKind::Disabled)
        );
        assert_eq!(ext.snooze.limit, Mode::Sentinel(SnoozeLimitKind::NoLimit));
    }

    #[test]
    fn test_unknown_mode_rejects_alarm() {
        let mut config = full_extended_config();
        config["snoozeLimit"] = json!(9);
        let err = decode_alarm(&json!({
            "hour": 6, "minutes": 15,
            "daysOfWeek": {"weekRepeat": 0, "days": 1},
            "extendedConfig": config
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnknownMode { ref field, value: 9 } if field == "extendedConfig.snoozeLimit"
        ));
    }

    #[test]
    fn test_out_of_range_time() {
        let err = decode_alarm(&json!({
            "hour": 24, "minutes": 0,
            "daysOfWeek": {"weekRepeat": 0, "days": 1}
        }))
        .unwrap_err();
        assert!(matches!(err, DecodeError::OutOfRange { value: 24, .. }));

        let err = decode_alarm(&json!({
            "hour": 1, "minutes": 60,
            "daysOfWeek": {"weekRepeat": 0, "days": 1}
        }))
        .unwrap_err();
        assert!(matches!(err, DecodeError::OutOfRange { value: 60, .. }));
    }

    #[test]
    fn test_bad_element_skipped_siblings_kept() {
        let payload = json!([
            {"id": 1, "hour": 7, "minutes": 0, "daysOfWeek": {"weekRepeat": 0, "days": 1}},
            {"id": 2, "minutes": 0, "daysOfWeek": {"weekRepeat": 0, "days": 1}},
            {"id": 3, "hour": 8, "minutes": 0},
            {"id": 4, "hour": "eight", "minutes": 0, "daysOfWeek": {"weekRepeat": 0, "days": 1}},
            {"id": 5, "hour": 9, "minutes": 15, "daysOfWeek": {"weekRepeat": 1, "days": 2}}
        ]);
        let batch = decode_alarms(&to_bytes(&payload)).unwrap();

        let ids: Vec<i64> = batch.records.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 5]);

        let rejected: Vec<usize> = batch.rejected.iter().map(|(i, _)| *i).collect();
        assert_eq!(rejected, vec![1, 2, 3]);
        assert!(matches!(batch.rejected[0].1, DecodeError::MissingField(ref f) if f == "hour"));
        assert!(matches!(batch.rejected[1].1, DecodeError::MissingField(ref f) if f == "daysOfWeek"));
        assert!(matches!(batch.rejected[2].1, DecodeError::Shape(_)));
    }

    #[test]
    fn test_alarm_payload_must_be_array() {
        let err = decode_alarms(br#"{"id":1}"#).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnexpectedType { expected: "array", found: "object" }
        ));
        assert_eq!(
            decode_alarms(b"[").unwrap_err().kind(),
            ErrorKind::MalformedPayload
        );
    }

    #[test]
    fn test_missing_id_defaults() {
        let alarm = decode_alarm(&json!({
            "hour": 6, "minutes": 0, "daysOfWeek": {"weekRepeat": 0, "days": 0}
        }))
        .unwrap();
        assert_eq!(alarm.id, -1);
    }

    #[test]
    fn test_alarm_serialization_field_names() {
        let alarm = decode_alarm(&json!({
            "id": 2, "hour": 6, "minutes": 5, "enabled": false, "captcha": -1,
            "daysOfWeek": {"weekRepeat": 0, "days": 3}
        }))
        .unwrap();
        let value = serde_json::to_value(&alarm).unwrap();
        assert_eq!(value["minutes"], 5);
        assert_eq!(value["days_of_week"]["value"], "WEEKLY");
        assert_eq!(value["captcha"], "DEFAULT");
        assert_eq!(value["enabled"], false);
        assert_eq!(value["label"], Value::Null);
    }
}
