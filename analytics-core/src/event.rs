use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

pub type Properties = Map<String, Value>;

/// The fixed set of event types accepted by the ingestion API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Track,
    Page,
    Identify,
    Group,
    Alias,
    Screen,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::Track => write!(f, "track"),
            EventType::Page => write!(f, "page"),
            EventType::Identify => write!(f, "identify"),
            EventType::Group => write!(f, "group"),
            EventType::Alias => write!(f, "alias"),
            EventType::Screen => write!(f, "screen"),
        }
    }
}

/// Format a timestamp the way the ingestion API expects it: ISO8601, UTC, millisecond precision.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(timestamp))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// The normalized envelope of one tracked event.
///
/// Only the timestamp, message id, context, integrations and metadata may be rewritten once
/// the envelope is built; every other field is read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anonymous_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Properties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    traits: Option<Properties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_id: Option<String>,
    #[serde(with = "iso_millis")]
    timestamp: DateTime<Utc>,
    message_id: String,
    #[serde(default)]
    context: Properties,
    #[serde(default)]
    integrations: Properties,
    #[serde(rename = "_metadata", default, skip_serializing_if = "Map::is_empty")]
    metadata: Properties,
}

impl Event {
    pub fn builder(event_type: EventType) -> EventBuilder {
        EventBuilder::new(event_type)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn anonymous_id(&self) -> Option<&str> {
        self.anonymous_id.as_deref()
    }

    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn properties(&self) -> Option<&Properties> {
        self.properties.as_ref()
    }

    pub fn traits(&self) -> Option<&Properties> {
        self.traits.as_ref()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn previous_id(&self) -> Option<&str> {
        self.previous_id.as_deref()
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn context(&self) -> &Properties {
        &self.context
    }

    pub fn integrations(&self) -> &Properties {
        &self.integrations
    }

    pub fn metadata(&self) -> &Properties {
        &self.metadata
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp;
    }

    pub fn set_message_id(&mut self, message_id: &str) {
        self.message_id = message_id.to_owned();
    }

    pub fn context_mut(&mut self) -> &mut Properties {
        &mut self.context
    }

    pub fn integrations_mut(&mut self) -> &mut Properties {
        &mut self.integrations
    }

    pub fn metadata_mut(&mut self) -> &mut Properties {
        &mut self.metadata
    }

    /// Check the type-specific required fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_blank(&self.user_id) && is_blank(&self.anonymous_id) {
            return Err(ValidationError::new(
                "userId/anonymousId",
                "must have userId or anonymousId",
            ));
        }
        if self.message_id.is_empty() {
            return Err(ValidationError::new("messageId", "messageId is empty"));
        }

        match self.event_type {
            EventType::Track if is_blank(&self.event) => {
                Err(ValidationError::new("event", "event name is missing"))
            }
            EventType::Group if is_blank(&self.group_id) => {
                Err(ValidationError::new("groupId", "groupId is missing"))
            }
            EventType::Alias if is_blank(&self.previous_id) => {
                Err(ValidationError::new("previousId", "previousId is missing"))
            }
            _ => Ok(()),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Builder for an `Event`. Fields the type does not use are left out of the envelope.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new(event_type: EventType) -> Self {
        let (properties, traits) = match event_type {
            EventType::Track | EventType::Page | EventType::Screen => (Some(Map::new()), None),
            EventType::Identify | EventType::Group => (None, Some(Map::new())),
            EventType::Alias => (None, None),
        };

        Self {
            event: Event {
                event_type,
                user_id: None,
                anonymous_id: None,
                event: None,
                name: None,
                category: None,
                properties,
                traits,
                group_id: None,
                previous_id: None,
                timestamp: Utc::now(),
                message_id: Uuid::now_v7().to_string(),
                context: Map::new(),
                integrations: Map::new(),
                metadata: Map::new(),
            },
        }
    }

    pub fn user_id(mut self, user_id: Option<String>) -> Self {
        self.event.user_id = user_id;
        self
    }

    pub fn anonymous_id(mut self, anonymous_id: Option<String>) -> Self {
        self.event.anonymous_id = anonymous_id;
        self
    }

    pub fn event(mut self, event: &str) -> Self {
        self.event.event = Some(event.to_owned());
        self
    }

    pub fn name(mut self, name: Option<String>) -> Self {
        self.event.name = name;
        self
    }

    pub fn category(mut self, category: Option<String>) -> Self {
        self.event.category = category;
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.event.properties = Some(properties);
        self
    }

    pub fn traits(mut self, traits: Properties) -> Self {
        self.event.traits = Some(traits);
        self
    }

    pub fn group_id(mut self, group_id: &str) -> Self {
        self.event.group_id = Some(group_id.to_owned());
        self
    }

    pub fn previous_id(mut self, previous_id: &str) -> Self {
        self.event.previous_id = Some(previous_id.to_owned());
        self
    }

    pub fn timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        if let Some(timestamp) = timestamp {
            self.event.timestamp = timestamp;
        }
        self
    }

    pub fn message_id(mut self, message_id: Option<String>) -> Self {
        if let Some(message_id) = message_id {
            self.event.message_id = message_id;
        }
        self
    }

    pub fn context(mut self, context: Properties) -> Self {
        self.event.context = context;
        self
    }

    pub fn integrations(mut self, integrations: Properties) -> Self {
        self.event.integrations = integrations;
        self
    }

    pub fn metadata(mut self, metadata: Properties) -> Self {
        self.event.metadata = metadata;
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn serializes_a_track_event_with_wire_field_names() {
        let mut properties = Map::new();
        properties.insert("count".to_owned(), json!(1));

        let event = Event::builder(EventType::Track)
            .user_id(Some("some-user".to_owned()))
            .event("some-event")
            .properties(properties)
            .timestamp(Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()))
            .message_id(Some("message-1".to_owned()))
            .build();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "track",
                "userId": "some-user",
                "event": "some-event",
                "properties": {"count": 1},
                "timestamp": "2024-01-02T03:04:05.000Z",
                "messageId": "message-1",
                "context": {},
                "integrations": {},
            })
        );
    }

    #[test]
    fn alias_and_group_carry_their_specific_fields() {
        let alias = Event::builder(EventType::Alias)
            .user_id(Some("some-user".to_owned()))
            .previous_id("other-user")
            .build();
        let value = serde_json::to_value(&alias).unwrap();
        assert_eq!(value["previousId"], json!("other-user"));
        assert!(value.get("properties").is_none());
        assert!(value.get("traits").is_none());

        let group = Event::builder(EventType::Group)
            .user_id(Some("some-user".to_owned()))
            .group_id("some-group")
            .build();
        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(value["groupId"], json!("some-group"));
        assert_eq!(value["traits"], json!({}));
    }

    #[test]
    fn generated_message_ids_are_unique() {
        let first = Event::builder(EventType::Identify)
            .user_id(Some("a".to_owned()))
            .build();
        let second = Event::builder(EventType::Identify)
            .user_id(Some("a".to_owned()))
            .build();

        assert_ne!(first.message_id(), second.message_id());
    }

    #[test]
    fn validate_requires_an_identity() {
        let event = Event::builder(EventType::Track).event("e").build();
        let err = event.validate().expect_err("missing identity should fail");
        assert_eq!(err.field, "userId/anonymousId");

        let event = Event::builder(EventType::Track)
            .anonymous_id(Some("anon".to_owned()))
            .event("e")
            .build();
        assert!(event.validate().is_ok());
    }

    #[test]
    fn validate_checks_type_specific_fields() {
        let track = Event::builder(EventType::Track)
            .user_id(Some("u".to_owned()))
            .build();
        assert_eq!(track.validate().unwrap_err().field, "event");

        let group = Event::builder(EventType::Group)
            .user_id(Some("u".to_owned()))
            .build();
        assert_eq!(group.validate().unwrap_err().field, "groupId");

        let alias = Event::builder(EventType::Alias)
            .user_id(Some("u".to_owned()))
            .build();
        assert_eq!(alias.validate().unwrap_err().field, "previousId");

        let page = Event::builder(EventType::Page)
            .user_id(Some("u".to_owned()))
            .build();
        assert!(page.validate().is_ok());
    }

    #[test]
    fn timestamps_round_trip_with_millisecond_precision() {
        let timestamp = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(format_timestamp(&timestamp), "2023-11-14T22:13:20.123Z");

        let event = Event::builder(EventType::Screen)
            .user_id(Some("u".to_owned()))
            .timestamp(Some(timestamp))
            .build();
        let raw = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.timestamp(), &timestamp);
    }
}
