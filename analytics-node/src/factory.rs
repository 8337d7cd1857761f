use analytics_core::event::{Event, EventBuilder, EventType, Properties};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

pub const LIBRARY_NAME: &str = "analytics-node";
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fields every tracking call accepts.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// When the event happened. Defaults to the time of the call.
    pub timestamp: Option<DateTime<Utc>>,
    /// Deduplication key. Defaults to a fresh UUID.
    pub message_id: Option<String>,
    pub context: Properties,
    pub integrations: Properties,
}

#[derive(Debug, Clone, Default)]
pub struct TrackParams {
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub event: String,
    pub properties: Properties,
    pub options: Options,
}

#[derive(Debug, Clone, Default)]
pub struct PageParams {
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub category: Option<String>,
    pub name: Option<String>,
    pub properties: Properties,
    pub options: Options,
}

#[derive(Debug, Clone, Default)]
pub struct ScreenParams {
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub name: Option<String>,
    pub properties: Properties,
    pub options: Options,
}

#[derive(Debug, Clone, Default)]
pub struct IdentifyParams {
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub traits: Properties,
    pub options: Options,
}

#[derive(Debug, Clone, Default)]
pub struct GroupParams {
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub group_id: String,
    pub traits: Properties,
    pub options: Options,
}

#[derive(Debug, Clone, Default)]
pub struct AliasParams {
    pub user_id: String,
    pub previous_id: String,
    pub options: Options,
}

/// Builds normalized envelopes for the tracking calls, stamped with the library identity.
#[derive(Debug, Clone)]
pub struct EventFactory {
    library: Value,
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFactory {
    pub fn new() -> Self {
        Self {
            library: json!({ "name": LIBRARY_NAME, "version": LIBRARY_VERSION }),
        }
    }

    pub fn track(&self, params: TrackParams) -> Event {
        let builder = Event::builder(EventType::Track)
            .user_id(params.user_id)
            .anonymous_id(params.anonymous_id)
            .event(&params.event)
            .properties(params.properties);

        self.finish(builder, params.options)
    }

    pub fn page(&self, params: PageParams) -> Event {
        let builder = Event::builder(EventType::Page)
            .user_id(params.user_id)
            .anonymous_id(params.anonymous_id)
            .category(params.category)
            .name(params.name)
            .properties(params.properties);

        self.finish(builder, params.options)
    }

    pub fn screen(&self, params: ScreenParams) -> Event {
        let builder = Event::builder(EventType::Screen)
            .user_id(params.user_id)
            .anonymous_id(params.anonymous_id)
            .name(params.name)
            .properties(params.properties);

        self.finish(builder, params.options)
    }

    pub fn identify(&self, params: IdentifyParams) -> Event {
        let builder = Event::builder(EventType::Identify)
            .user_id(params.user_id)
            .anonymous_id(params.anonymous_id)
            .traits(params.traits);

        self.finish(builder, params.options)
    }

    pub fn group(&self, params: GroupParams) -> Event {
        let builder = Event::builder(EventType::Group)
            .user_id(params.user_id)
            .anonymous_id(params.anonymous_id)
            .group_id(&params.group_id)
            .traits(params.traits);

        self.finish(builder, params.options)
    }

    pub fn alias(&self, params: AliasParams) -> Event {
        let builder = Event::builder(EventType::Alias)
            .user_id(Some(params.user_id))
            .previous_id(&params.previous_id);

        self.finish(builder, params.options)
    }

    fn finish(&self, builder: EventBuilder, options: Options) -> Event {
        let mut context = options.context;
        context
            .entry("library")
            .or_insert_with(|| self.library.clone());

        let mut metadata = Map::new();
        metadata.insert("jsRuntime".to_owned(), Value::from("rust"));

        builder
            .timestamp(options.timestamp)
            .message_id(options.message_id)
            .context(context)
            .integrations(options.integrations)
            .metadata(metadata)
            .build()
    }
}
