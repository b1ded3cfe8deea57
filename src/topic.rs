//! Topic template handling.
//!
//! A template such as `SleepAsHA/%%%device%%%` names one path segment as the
//! device identifier. From it we derive the subscription wildcard
//! (`SleepAsHA/+`), the companion alarm pattern (`SleepAsHA/+/alarms`) and the
//! device name of every inbound topic.

use dashmap::DashMap;

/// Default placeholder token marking the device segment.
pub const DEVICE_PLACEHOLDER: &str = "%%%device%%%";

/// Suffix appended to the state pattern for alarm payloads.
pub const ALARMS_SUFFIX: &str = "alarms";

/// Index of the first segment equal to `placeholder`, or the segment count
/// when the template has none.
pub fn device_placeholder_position(template: &str, placeholder: &str) -> usize {
    let segments: Vec<&str> = template.split('/').collect();
    segments
        .iter()
        .position(|segment| *segment == placeholder)
        .unwrap_or(segments.len())
}

/// Segment of `topic` at `position`, falling back to the last segment.
pub fn device_name_from_topic(topic: &str, position: usize) -> String {
    let segments: Vec<&str> = topic.split('/').collect();
    segments
        .get(position)
        .or_else(|| segments.last())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// `template` with the segment at `position` replaced by `+`.
pub fn subscription_pattern(template: &str, position: usize) -> String {
    let mut segments: Vec<&str> = template.split('/').collect();
    if position >= segments.len() {
        return template.to_string();
    }
    segments[position] = "+";
    segments.join("/")
}

/// MQTT filter matching: `+` spans one level, a trailing `#` the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

/// Resolves device names for one configured template.
///
/// Everything derivable from the template is computed on construction; topic
/// lookups are memoized since the device set is small and stable.
pub struct TopicResolver {
    template: String,
    placeholder: String,
    position: usize,
    state_pattern: String,
    alarm_pattern: String,
    names: DashMap<String, String>,
}

impl TopicResolver {
    pub fn with_placeholder(template: &str, placeholder: &str) -> Self {
        let position = device_placeholder_position(template, placeholder);
        let state_pattern = subscription_pattern(template, position);
        let alarm_pattern = format!("{}/{}", state_pattern, ALARMS_SUFFIX);
        Self {
            template: template.to_string(),
            placeholder: placeholder.to_string(),
            position,
            state_pattern,
            alarm_pattern,
            names: DashMap::new(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// False when the template carries no placeholder segment; every topic
    /// then maps to its last segment.
    pub fn has_placeholder(&self) -> bool {
        self.position < self.template.split('/').count()
    }

    pub fn state_pattern(&self) -> &str {
        &self.state_pattern
    }

    pub fn alarm_pattern(&self) -> &str {
        &self.alarm_pattern
    }

    pub fn is_state_topic(&self, topic: &str) -> bool {
        topic_matches(&self.state_pattern, topic)
    }

    pub fn is_alarm_topic(&self, topic: &str) -> bool {
        topic_matches(&self.alarm_pattern, topic)
    }

    /// Device name for a state topic.
    pub fn device_name(&self, topic: &str) -> String {
        if let Some(name) = self.names.get(topic) {
            return name.value().clone();
        }
        let name = device_name_from_topic(topic, self.position);
        self.names.insert(topic.to_string(), name.clone());
        name
    }

    /// Device name for an alarm topic: the `/alarms` suffix is dropped first
    /// so the no-placeholder fallback does not yield "alarms".
    pub fn device_name_for_alarms(&self, topic: &str) -> String {
        let base = topic
            .strip_suffix(ALARMS_SUFFIX)
            .and_then(|t| t.strip_suffix('/'))
            .unwrap_or(topic);
        self.device_name(base)
    }
}
