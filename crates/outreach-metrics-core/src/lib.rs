//! Event-sourced outreach metrics.
//!
//! Every dashboard KPI is derived from the append-only `outreach_events` log.
//! This crate holds the event model, the [`EventStore`] and
//! [`DeclarativeMetrics`] seams, an in-memory store, and the replay engine
//! that recomputes KPIs from raw events for a fixed "now".

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime, Time, UtcOffset};
use ulid::Ulid;

mod dashboard;
mod generator;
mod validation;

pub use dashboard::{
    build_dashboard, campaign_snapshots, decide_system_status, derive_system_health,
    followups_scheduled_on_local_day, load_dashboard, next_actions, send_percentage,
    CampaignDetail, CampaignSnapshot, CampaignStatus, DashboardKpis, DashboardStats, NextAction,
    PausedCampaign, SystemContext, SystemHealth, SystemStatus, NO_DATA_REASON,
    NO_WORKSPACE_REASON,
};
pub use generator::{generate_seed_events, SeedPlan};
pub use validation::{
    compare_kpis, validate_workspace, ComputationArm, Divergence, KpiMetric, MetricComparison,
    ValidationReport, VALIDATION_CONTRACT_VERSION,
};

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OutreachError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parses a trimmed, non-empty identifier.
            ///
            /// # Errors
            /// Returns [`OutreachError::Validation`] when the value is blank
            /// or longer than the supported identifier length.
            pub fn parse(value: &str) -> Result<Self, OutreachError> {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(OutreachError::Validation(format!(
                        "{} MUST be non-empty",
                        $label
                    )));
                }
                if trimmed.len() > MAX_ID_LEN {
                    return Err(OutreachError::Validation(format!(
                        "{} MUST be at most {MAX_ID_LEN} bytes",
                        $label
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = OutreachError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

opaque_id!(
    /// Tenant boundary. Every query is scoped to exactly one workspace.
    WorkspaceId,
    "workspace_id"
);
opaque_id!(CampaignId, "campaign_id");
opaque_id!(LeadId, "lead_id");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EventId(pub Ulid);

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EventId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID-encoded event id.
    ///
    /// # Errors
    /// Returns [`OutreachError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, OutreachError> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| OutreachError::Validation(format!("invalid event_id: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutreachEventType {
    MessageQueued,
    MessageSent,
    MessageFailed,
    ReplyReceived,
    ReplyClassified,
    FollowupScheduled,
    FollowupSent,
    CampaignPaused,
    CampaignResumed,
    AutomationThrottled,
    AutomationResumed,
    CaptchaDetected,
    ManualActionRequired,
}

impl OutreachEventType {
    pub const ALL: [Self; 13] = [
        Self::MessageQueued,
        Self::MessageSent,
        Self::MessageFailed,
        Self::ReplyReceived,
        Self::ReplyClassified,
        Self::FollowupScheduled,
        Self::FollowupSent,
        Self::CampaignPaused,
        Self::CampaignResumed,
        Self::AutomationThrottled,
        Self::AutomationResumed,
        Self::CaptchaDetected,
        Self::ManualActionRequired,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageQueued => "message_queued",
            Self::MessageSent => "message_sent",
            Self::MessageFailed => "message_failed",
            Self::ReplyReceived => "reply_received",
            Self::ReplyClassified => "reply_classified",
            Self::FollowupScheduled => "followup_scheduled",
            Self::FollowupSent => "followup_sent",
            Self::CampaignPaused => "campaign_paused",
            Self::CampaignResumed => "campaign_resumed",
            Self::AutomationThrottled => "automation_throttled",
            Self::AutomationResumed => "automation_resumed",
            Self::CaptchaDetected => "captcha_detected",
            Self::ManualActionRequired => "manual_action_required",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
    }

    /// Events that resolve a reply for "needing action" purposes.
    #[must_use]
    pub fn resolves_reply(self) -> bool {
        matches!(self, Self::ReplyClassified | Self::ManualActionRequired)
    }
}

impl Display for OutreachEventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque key-value bag carried for display and debugging only.
///
/// Metrics never read from it. A field a KPI needs must become a typed column.
pub type EventMetadata = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutreachEvent {
    pub event_seq: i64,
    pub event_id: EventId,
    pub workspace_id: WorkspaceId,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub event_type: OutreachEventType,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutreachEventInput {
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub campaign_id: Option<CampaignId>,
    #[serde(default)]
    pub lead_id: Option<LeadId>,
    pub event_type: OutreachEventType,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub event_timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl OutreachEventInput {
    #[must_use]
    pub fn new(workspace_id: WorkspaceId, event_type: OutreachEventType) -> Self {
        Self {
            workspace_id,
            campaign_id: None,
            lead_id: None,
            event_type,
            event_timestamp: None,
            metadata: EventMetadata::new(),
        }
    }

    #[must_use]
    pub fn with_campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    #[must_use]
    pub fn with_lead(mut self, lead_id: LeadId) -> Self {
        self.lead_id = Some(lead_id);
        self
    }

    #[must_use]
    pub fn at(mut self, event_timestamp: OffsetDateTime) -> Self {
        self.event_timestamp = Some(event_timestamp);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Validates an append payload before it reaches a store.
    ///
    /// # Errors
    /// Returns [`OutreachError::Validation`] when the event timestamp cannot
    /// be represented by the store's nanosecond clock.
    pub fn validate(&self) -> Result<(), OutreachError> {
        if let Some(timestamp) = self.event_timestamp {
            to_unix_nanos(timestamp)?;
        }
        Ok(())
    }

    /// Decodes the producer append payload
    /// `{workspaceId, campaignId?, leadId?, eventType, eventTimestamp?, metadata?}`.
    ///
    /// Keys are accepted in camelCase or `snake_case`.
    ///
    /// # Errors
    /// Returns [`OutreachError::Validation`] when `workspaceId` or `eventType`
    /// is missing, the event type is outside the closed enumeration, the
    /// timestamp is not RFC3339, or `metadata` is not an object.
    pub fn from_payload(value: &Value) -> Result<Self, OutreachError> {
        let Some(object) = value.as_object() else {
            return Err(OutreachError::Validation(
                "event payload MUST be a JSON object".to_string(),
            ));
        };

        let workspace_id = match payload_field(object, "workspace_id", "workspaceId") {
            Some(Value::String(raw)) => WorkspaceId::parse(raw)?,
            Some(Value::Null) | None => {
                return Err(OutreachError::Validation(
                    "workspace_id is required".to_string(),
                ))
            }
            Some(_) => {
                return Err(OutreachError::Validation(
                    "workspace_id MUST be a string".to_string(),
                ))
            }
        };

        let event_type = match payload_field(object, "event_type", "eventType") {
            Some(Value::String(raw)) => OutreachEventType::parse(raw).ok_or_else(|| {
                OutreachError::Validation(format!("unknown event_type: {raw}"))
            })?,
            Some(Value::Null) | None => {
                return Err(OutreachError::Validation(
                    "event_type is required".to_string(),
                ))
            }
            Some(_) => {
                return Err(OutreachError::Validation(
                    "event_type MUST be a string".to_string(),
                ))
            }
        };

        let campaign_id = optional_payload_id(object, "campaign_id", "campaignId")?
            .map(|raw| CampaignId::parse(&raw))
            .transpose()?;
        let lead_id = optional_payload_id(object, "lead_id", "leadId")?
            .map(|raw| LeadId::parse(&raw))
            .transpose()?;

        let event_timestamp = match payload_field(object, "event_timestamp", "eventTimestamp") {
            Some(Value::String(raw)) => Some(parse_rfc3339(raw)?.to_offset(UtcOffset::UTC)),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(OutreachError::Validation(
                    "event_timestamp MUST be an RFC3339 string".to_string(),
                ))
            }
        };

        let metadata = match object.get("metadata") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => EventMetadata::new(),
            Some(_) => {
                return Err(OutreachError::Validation(
                    "metadata MUST be a JSON object".to_string(),
                ))
            }
        };

        let input = Self {
            workspace_id,
            campaign_id,
            lead_id,
            event_type,
            event_timestamp,
            metadata,
        };
        input.validate()?;
        Ok(input)
    }

    /// Materializes the stored record. `event_timestamp` falls back to
    /// `recorded_at` when the producer did not backdate the event.
    #[must_use]
    pub fn to_event(
        &self,
        event_seq: i64,
        event_id: EventId,
        recorded_at: OffsetDateTime,
    ) -> OutreachEvent {
        OutreachEvent {
            event_seq,
            event_id,
            workspace_id: self.workspace_id.clone(),
            campaign_id: self.campaign_id.clone(),
            lead_id: self.lead_id.clone(),
            event_type: self.event_type,
            event_timestamp: self
                .event_timestamp
                .unwrap_or(recorded_at)
                .to_offset(UtcOffset::UTC),
            recorded_at: recorded_at.to_offset(UtcOffset::UTC),
            metadata: self.metadata.clone(),
        }
    }
}

fn payload_field<'a>(object: &'a EventMetadata, snake: &str, camel: &str) -> Option<&'a Value> {
    object.get(snake).or_else(|| object.get(camel))
}

fn optional_payload_id(
    object: &EventMetadata,
    snake: &str,
    camel: &str,
) -> Result<Option<String>, OutreachError> {
    match payload_field(object, snake, camel) {
        Some(Value::String(raw)) => Ok(Some(raw.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(OutreachError::Validation(format!(
            "{snake} MUST be a string or null"
        ))),
    }
}

/// Conjunctive filters over one workspace's events. Time bounds are inclusive
/// and apply to `event_timestamp`, never to arrival order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventQuery {
    pub event_type: Option<OutreachEventType>,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

impl EventQuery {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn of_type(event_type: OutreachEventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn between(mut self, start_time: OffsetDateTime, end_time: OffsetDateTime) -> Self {
        self.start_time = Some(start_time);
        self.end_time = Some(end_time);
        self
    }

    #[must_use]
    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// # Errors
    /// Returns [`OutreachError::Validation`] for an inverted time range or a
    /// zero limit.
    pub fn validate(&self) -> Result<(), OutreachError> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(OutreachError::Validation(
                    "start_time MUST NOT be after end_time".to_string(),
                ));
            }
        }

        if self.limit == Some(0) {
            return Err(OutreachError::Validation(
                "limit MUST be >= 1 when provided".to_string(),
            ));
        }

        for bound in [self.start_time, self.end_time].into_iter().flatten() {
            to_unix_nanos(bound)?;
        }

        Ok(())
    }

    #[must_use]
    pub fn matches(&self, event: &OutreachEvent) -> bool {
        if self
            .event_type
            .is_some_and(|event_type| event.event_type != event_type)
        {
            return false;
        }
        if self
            .campaign_id
            .as_ref()
            .is_some_and(|campaign| event.campaign_id.as_ref() != Some(campaign))
        {
            return false;
        }
        if self
            .lead_id
            .as_ref()
            .is_some_and(|lead| event.lead_id.as_ref() != Some(lead))
        {
            return false;
        }
        if self
            .start_time
            .is_some_and(|start| event.event_timestamp < start)
        {
            return false;
        }
        if self.end_time.is_some_and(|end| event.event_timestamp > end) {
            return false;
        }
        true
    }
}

/// Display order: newest `event_timestamp` first, arrival order breaking ties.
pub fn sort_for_display(events: &mut [OutreachEvent]) {
    events.sort_by(|lhs, rhs| {
        rhs.event_timestamp
            .cmp(&lhs.event_timestamp)
            .then(rhs.event_seq.cmp(&lhs.event_seq))
    });
}

/// Append-only event log. There is no update or delete.
pub trait EventStore {
    /// Appends one event and returns its assigned id.
    ///
    /// # Errors
    /// [`OutreachError::Validation`] for malformed input,
    /// [`OutreachError::DataUnavailable`] when the write cannot be persisted.
    fn append(&mut self, input: &OutreachEventInput) -> Result<EventId, OutreachError>;

    /// Appends every event or none of them. Returns the number appended.
    ///
    /// # Errors
    /// Any per-event validation failure or write failure fails the batch.
    fn append_batch(&mut self, inputs: &[OutreachEventInput]) -> Result<usize, OutreachError>;

    /// Returns matching events, newest first. An empty result is not an error.
    ///
    /// # Errors
    /// [`OutreachError::Validation`] for malformed filters,
    /// [`OutreachError::DataUnavailable`] when the read fails.
    fn query(
        &self,
        workspace_id: &WorkspaceId,
        filters: &EventQuery,
    ) -> Result<Vec<OutreachEvent>, OutreachError>;
}

/// The second, independently derived KPI computation (views/SQL aggregates).
pub trait DeclarativeMetrics {
    /// # Errors
    /// [`OutreachError::DataUnavailable`] when the aggregation cannot run.
    fn declarative_kpis(
        &self,
        workspace_id: &WorkspaceId,
        now: OffsetDateTime,
        reply_window_days: u16,
    ) -> Result<KpiSnapshot, OutreachError>;

    /// Item-level sets behind the declarative KPIs, used for divergence
    /// diagnostics.
    ///
    /// # Errors
    /// [`OutreachError::DataUnavailable`] when the aggregation cannot run.
    fn declarative_breakdown(
        &self,
        workspace_id: &WorkspaceId,
        now: OffsetDateTime,
        reply_window_days: u16,
    ) -> Result<KpiBreakdown, OutreachError>;
}

/// Upstream authorization hook. Workspace validity is decided by the host.
pub trait WorkspaceAccess {
    /// # Errors
    /// Returns [`OutreachError::NotFound`] when the workspace is not
    /// accessible to the caller.
    fn authorize(&self, workspace_id: &WorkspaceId) -> Result<(), OutreachError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllWorkspaces;

impl WorkspaceAccess for AllowAllWorkspaces {
    fn authorize(&self, _workspace_id: &WorkspaceId) -> Result<(), OutreachError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    pub config_version: u32,
    pub reply_rate_window_days: u16,
    pub utc_offset_minutes: i16,
    pub default_daily_limit: u32,
    #[serde(default)]
    pub allowed_workspaces: Vec<WorkspaceId>,
}

impl MetricsConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            reply_rate_window_days: 7,
            utc_offset_minutes: 0,
            default_daily_limit: 120,
            allowed_workspaces: Vec::new(),
        }
    }

    /// # Errors
    /// Returns [`OutreachError::Configuration`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), OutreachError> {
        if self.config_version == 0 {
            return Err(OutreachError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        if !(1..=365).contains(&self.reply_rate_window_days) {
            return Err(OutreachError::Configuration(
                "reply_rate_window_days MUST be in [1, 365]".to_string(),
            ));
        }

        if !(-720..=840).contains(&self.utc_offset_minutes) {
            return Err(OutreachError::Configuration(
                "utc_offset_minutes MUST be in [-720, 840]".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`OutreachError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration bounds.
    pub fn from_json(value: &Value) -> Result<Self, OutreachError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            OutreachError::Configuration(format!("invalid metrics config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`OutreachError::Configuration`] when the offset is invalid.
    pub fn utc_offset(&self) -> Result<UtcOffset, OutreachError> {
        UtcOffset::from_whole_seconds(i32::from(self.utc_offset_minutes) * 60).map_err(|err| {
            OutreachError::Configuration(format!("invalid utc_offset_minutes: {err}"))
        })
    }

    /// Expresses an instant in the reporting offset, which defines "local
    /// midnight" for today's sends.
    ///
    /// # Errors
    /// Returns [`OutreachError::Configuration`] when the offset is invalid.
    pub fn local_now(&self, instant: OffsetDateTime) -> Result<OffsetDateTime, OutreachError> {
        Ok(instant.to_offset(self.utc_offset()?))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self::v1()
    }
}

impl WorkspaceAccess for MetricsConfig {
    fn authorize(&self, workspace_id: &WorkspaceId) -> Result<(), OutreachError> {
        if self.allowed_workspaces.is_empty() || self.allowed_workspaces.contains(workspace_id) {
            return Ok(());
        }
        Err(OutreachError::NotFound(format!(
            "workspace {workspace_id} is not accessible"
        )))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: Vec<OutreachEvent>,
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn next_seq(&self) -> i64 {
        i64::try_from(self.events.len()).map_or(i64::MAX, |len| len + 1)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&mut self, input: &OutreachEventInput) -> Result<EventId, OutreachError> {
        input.validate()?;
        let event = input.to_event(self.next_seq(), EventId::generate(), now_utc());
        let event_id = event.event_id;
        self.events.push(event);
        Ok(event_id)
    }

    fn append_batch(&mut self, inputs: &[OutreachEventInput]) -> Result<usize, OutreachError> {
        for (index, input) in inputs.iter().enumerate() {
            input.validate().map_err(|err| {
                OutreachError::Validation(format!("batch item {index} rejected: {err}"))
            })?;
        }

        let recorded_at = now_utc();
        for input in inputs {
            let event = input.to_event(self.next_seq(), EventId::generate(), recorded_at);
            self.events.push(event);
        }
        Ok(inputs.len())
    }

    fn query(
        &self,
        workspace_id: &WorkspaceId,
        filters: &EventQuery,
    ) -> Result<Vec<OutreachEvent>, OutreachError> {
        filters.validate()?;

        let mut matched = self
            .events
            .iter()
            .filter(|event| &event.workspace_id == workspace_id && filters.matches(event))
            .cloned()
            .collect::<Vec<_>>();
        sort_for_display(&mut matched);
        if let Some(limit) = filters.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

/// KPI response consumed by the dashboard.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiSnapshot {
    pub today_sends: u64,
    pub replies_needing_action: u64,
    pub reply_rate: u32,
}

/// The item-level sets every KPI is a count over.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct KpiBreakdown {
    pub today_send_event_ids: BTreeSet<EventId>,
    pub needing_action_leads: BTreeSet<LeadId>,
    pub sent_leads: BTreeSet<LeadId>,
    pub replied_leads: BTreeSet<LeadId>,
}

impl KpiBreakdown {
    #[must_use]
    pub fn snapshot(&self) -> KpiSnapshot {
        KpiSnapshot {
            today_sends: count_u64(self.today_send_event_ids.len()),
            replies_needing_action: count_u64(self.needing_action_leads.len()),
            reply_rate: reply_rate_percent(self.replied_leads.len(), self.sent_leads.len()),
        }
    }
}

/// Window bounds for one replay instant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReplayWindow {
    pub now: OffsetDateTime,
    pub today_start: OffsetDateTime,
    pub reply_window_start: OffsetDateTime,
}

impl ReplayWindow {
    /// `today_start` is midnight in `now`'s own offset.
    #[must_use]
    pub fn new(now: OffsetDateTime, reply_window_days: u16) -> Self {
        Self {
            now,
            today_start: now.replace_time(Time::MIDNIGHT),
            reply_window_start: now - Duration::days(i64::from(reply_window_days)),
        }
    }

    /// `todaySends` membership: on or after local midnight, with no upper
    /// bound. Sends stamped later than `now` still count.
    #[must_use]
    pub fn since_local_midnight(&self, timestamp: OffsetDateTime) -> bool {
        self.today_start <= timestamp
    }

    /// Calendar-day membership `[today_start, today_start + 1 day)`.
    #[must_use]
    pub fn on_local_day(&self, timestamp: OffsetDateTime) -> bool {
        self.today_start <= timestamp && timestamp < self.today_start + Duration::days(1)
    }

    #[must_use]
    pub fn in_reply_window(&self, timestamp: OffsetDateTime) -> bool {
        self.reply_window_start <= timestamp && timestamp <= self.now
    }
}

/// Folds raw events into the KPI sets for a fixed `now`.
///
/// Events with no `lead_id` never enter a lead-scoped set. A reply is resolved
/// by any classification or manual-action event for the same lead, at any
/// point in history.
#[must_use]
pub fn replay_breakdown(
    events: &[OutreachEvent],
    now: OffsetDateTime,
    reply_window_days: u16,
) -> KpiBreakdown {
    let window = ReplayWindow::new(now, reply_window_days);

    let mut today_send_event_ids = BTreeSet::new();
    let mut replied_ever = BTreeSet::new();
    let mut resolved = BTreeSet::new();
    let mut sent_leads = BTreeSet::new();
    let mut replied_in_window = BTreeSet::new();

    for event in events {
        match event.event_type {
            OutreachEventType::MessageSent => {
                if window.since_local_midnight(event.event_timestamp) {
                    today_send_event_ids.insert(event.event_id);
                }
                if let Some(lead) = &event.lead_id {
                    if window.in_reply_window(event.event_timestamp) {
                        sent_leads.insert(lead.clone());
                    }
                }
            }
            OutreachEventType::ReplyReceived => {
                if let Some(lead) = &event.lead_id {
                    replied_ever.insert(lead.clone());
                    if window.in_reply_window(event.event_timestamp) {
                        replied_in_window.insert(lead.clone());
                    }
                }
            }
            event_type if event_type.resolves_reply() => {
                if let Some(lead) = &event.lead_id {
                    resolved.insert(lead.clone());
                }
            }
            _ => {}
        }
    }

    let needing_action_leads = replied_ever.difference(&resolved).cloned().collect();
    let replied_leads = replied_in_window.intersection(&sent_leads).cloned().collect();

    KpiBreakdown {
        today_send_event_ids,
        needing_action_leads,
        sent_leads,
        replied_leads,
    }
}

#[must_use]
pub fn replay_kpis(
    events: &[OutreachEvent],
    now: OffsetDateTime,
    reply_window_days: u16,
) -> KpiSnapshot {
    replay_breakdown(events, now, reply_window_days).snapshot()
}

/// `round(100 * replied / sent)` with halves rounded up; 0 when nothing was sent.
#[must_use]
pub fn reply_rate_percent(replied: usize, sent: usize) -> u32 {
    if sent == 0 {
        return 0;
    }
    let replied = count_u64(replied);
    let sent = count_u64(sent);
    let rounded = (200 * replied + sent) / (2 * sent);
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

fn count_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Replay engine bound to an injected store handle.
pub struct MetricsEngine<'a, S: EventStore + ?Sized> {
    store: &'a S,
    config: &'a MetricsConfig,
    access: &'a dyn WorkspaceAccess,
}

impl<'a, S: EventStore + ?Sized> MetricsEngine<'a, S> {
    /// Uses `config.allowed_workspaces` as the access policy.
    #[must_use]
    pub fn new(store: &'a S, config: &'a MetricsConfig) -> Self {
        Self {
            store,
            config,
            access: config,
        }
    }

    #[must_use]
    pub fn with_access(mut self, access: &'a dyn WorkspaceAccess) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn config(&self) -> &MetricsConfig {
        self.config
    }

    /// Expresses `now` in the configured reporting offset, which defines
    /// local midnight for every computation the engine runs.
    ///
    /// # Errors
    /// [`OutreachError::Configuration`] when the configured offset is invalid.
    pub fn local_now(&self, now: OffsetDateTime) -> Result<OffsetDateTime, OutreachError> {
        self.config.local_now(now)
    }

    /// Full history of one workspace.
    ///
    /// # Errors
    /// [`OutreachError::NotFound`] when the workspace is not authorized and
    /// [`OutreachError::DataUnavailable`] when the store read fails.
    pub fn events(&self, workspace_id: &WorkspaceId) -> Result<Vec<OutreachEvent>, OutreachError> {
        self.access.authorize(workspace_id)?;
        self.store.query(workspace_id, &EventQuery::all())
    }

    /// Replays the workspace history at `now`, read in the configured offset.
    ///
    /// # Errors
    /// See [`MetricsEngine::events`] and [`MetricsEngine::local_now`].
    pub fn breakdown(
        &self,
        workspace_id: &WorkspaceId,
        now: OffsetDateTime,
    ) -> Result<KpiBreakdown, OutreachError> {
        let now = self.local_now(now)?;
        let events = self.events(workspace_id)?;
        tracing::debug!(
            workspace_id = %workspace_id,
            events = events.len(),
            now = %now,
            "replaying outreach events"
        );
        Ok(replay_breakdown(
            &events,
            now,
            self.config.reply_rate_window_days,
        ))
    }

    /// # Errors
    /// See [`MetricsEngine::breakdown`].
    pub fn compute(
        &self,
        workspace_id: &WorkspaceId,
        now: OffsetDateTime,
    ) -> Result<KpiSnapshot, OutreachError> {
        Ok(self.breakdown(workspace_id, now)?.snapshot())
    }
}

/// Parses an RFC3339 timestamp with any offset.
///
/// # Errors
/// Returns [`OutreachError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, OutreachError> {
    OffsetDateTime::parse(value.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|err| OutreachError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`OutreachError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, OutreachError> {
    let parsed = parse_rfc3339(value)?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(OutreachError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`OutreachError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, OutreachError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            OutreachError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Nanoseconds since the Unix epoch, the store's ordering key.
///
/// # Errors
/// Returns [`OutreachError::Validation`] outside the `i64` nanosecond range
/// (roughly years 1678 through 2262).
pub fn to_unix_nanos(value: OffsetDateTime) -> Result<i64, OutreachError> {
    i64::try_from(value.unix_timestamp_nanos()).map_err(|_| {
        OutreachError::Validation(format!("timestamp {value} is outside the supported range"))
    })
}

/// # Errors
/// Returns [`OutreachError::Validation`] when the value is not a valid instant.
pub fn from_unix_nanos(value: i64) -> Result<OffsetDateTime, OutreachError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|err| OutreachError::Validation(format!("invalid stored timestamp: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn workspace() -> WorkspaceId {
        must_ok(WorkspaceId::parse("ws-1"))
    }

    fn lead(raw: &str) -> LeadId {
        must_ok(LeadId::parse(raw))
    }

    fn input(event_type: OutreachEventType, lead_id: Option<&str>, at: &str) -> OutreachEventInput {
        let mut input = OutreachEventInput::new(workspace(), event_type).at(must_utc(at));
        if let Some(raw) = lead_id {
            input = input.with_lead(lead(raw));
        }
        input
    }

    fn events_from(inputs: &[OutreachEventInput]) -> Vec<OutreachEvent> {
        let mut store = InMemoryEventStore::new();
        must_ok(store.append_batch(inputs));
        must_ok(store.query(&workspace(), &EventQuery::all()))
    }

    const NOW: &str = "2026-02-07T15:00:00Z";

    #[test]
    fn event_type_round_trips_through_wire_names() {
        for event_type in OutreachEventType::ALL {
            assert_eq!(OutreachEventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(OutreachEventType::parse("message_opened"), None);
    }

    #[test]
    fn payload_requires_workspace_and_known_event_type() {
        let missing_workspace = OutreachEventInput::from_payload(&json!({
            "eventType": "message_sent"
        }));
        assert!(matches!(missing_workspace, Err(OutreachError::Validation(_))));

        let missing_type = OutreachEventInput::from_payload(&json!({
            "workspaceId": "ws-1"
        }));
        assert!(matches!(missing_type, Err(OutreachError::Validation(_))));

        let unknown_type = OutreachEventInput::from_payload(&json!({
            "workspaceId": "ws-1",
            "eventType": "message_opened"
        }));
        assert!(matches!(unknown_type, Err(OutreachError::Validation(_))));

        let blank_workspace = OutreachEventInput::from_payload(&json!({
            "workspace_id": "   ",
            "event_type": "message_sent"
        }));
        assert!(matches!(blank_workspace, Err(OutreachError::Validation(_))));
    }

    #[test]
    fn payload_accepts_camel_and_snake_case_and_normalizes_offsets() {
        let parsed = must_ok(OutreachEventInput::from_payload(&json!({
            "workspaceId": "ws-1",
            "campaign_id": "camp-1",
            "leadId": null,
            "eventType": "reply_received",
            "eventTimestamp": "2026-02-07T14:00:00+02:00",
            "metadata": {"body": "Thanks!"}
        })));

        assert_eq!(parsed.workspace_id, workspace());
        assert_eq!(parsed.campaign_id, Some(must_ok(CampaignId::parse("camp-1"))));
        assert_eq!(parsed.lead_id, None);
        assert_eq!(parsed.event_type, OutreachEventType::ReplyReceived);
        assert_eq!(parsed.event_timestamp, Some(must_utc("2026-02-07T12:00:00Z")));
        assert_eq!(
            parsed.event_timestamp.map(OffsetDateTime::offset),
            Some(UtcOffset::UTC)
        );
        assert_eq!(parsed.metadata.get("body"), Some(&json!("Thanks!")));
    }

    #[test]
    fn payload_rejects_non_object_metadata() {
        let result = OutreachEventInput::from_payload(&json!({
            "workspaceId": "ws-1",
            "eventType": "message_sent",
            "metadata": ["not", "a", "map"]
        }));
        assert!(matches!(result, Err(OutreachError::Validation(_))));
    }

    #[test]
    fn event_timestamp_defaults_to_recorded_at() {
        let recorded_at = must_utc("2026-02-07T09:30:00Z");
        let input = OutreachEventInput::new(workspace(), OutreachEventType::MessageQueued);
        let event = input.to_event(1, EventId::generate(), recorded_at);
        assert_eq!(event.event_timestamp, recorded_at);
        assert_eq!(event.recorded_at, recorded_at);
    }

    #[test]
    fn query_rejects_inverted_range_and_zero_limit() {
        let inverted = EventQuery::all().between(must_utc(NOW), must_utc("2026-02-01T00:00:00Z"));
        assert!(matches!(inverted.validate(), Err(OutreachError::Validation(_))));
        assert!(matches!(
            EventQuery::all().limited(0).validate(),
            Err(OutreachError::Validation(_))
        ));
    }

    #[test]
    fn in_memory_store_isolates_workspaces_and_orders_by_timestamp() {
        let mut store = InMemoryEventStore::new();
        let other = must_ok(WorkspaceId::parse("ws-2"));

        must_ok(store.append(&input(
            OutreachEventType::MessageSent,
            Some("a"),
            "2026-02-07T10:00:00Z",
        )));
        must_ok(store.append(&input(
            OutreachEventType::MessageSent,
            Some("b"),
            "2026-02-05T10:00:00Z",
        )));
        must_ok(store.append(
            &OutreachEventInput::new(other.clone(), OutreachEventType::MessageSent)
                .at(must_utc("2026-02-07T11:00:00Z")),
        ));

        let mine = must_ok(store.query(&workspace(), &EventQuery::all()));
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|event| event.workspace_id == workspace()));
        assert!(mine[0].event_timestamp > mine[1].event_timestamp);

        let theirs = must_ok(store.query(&other, &EventQuery::all()));
        assert_eq!(theirs.len(), 1);

        let nobody = must_ok(store.query(
            &must_ok(WorkspaceId::parse("ws-empty")),
            &EventQuery::all(),
        ));
        assert!(nobody.is_empty());
    }

    #[test]
    fn in_memory_batch_is_all_or_nothing() {
        let mut store = InMemoryEventStore::new();
        let mut bad = input(OutreachEventType::MessageSent, Some("a"), NOW);
        bad.event_timestamp = Some(must_utc("2300-01-01T00:00:00Z"));

        let result = store.append_batch(&[
            input(OutreachEventType::MessageSent, Some("a"), NOW),
            bad,
        ]);
        assert!(matches!(result, Err(OutreachError::Validation(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn in_memory_query_applies_conjunctive_filters() {
        let events = [
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-01T10:00:00Z"),
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-03T10:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("a"), "2026-02-03T11:00:00Z"),
            input(OutreachEventType::MessageSent, Some("b"), "2026-02-03T12:00:00Z"),
        ];
        let mut store = InMemoryEventStore::new();
        must_ok(store.append_batch(&events));

        let mut filters = EventQuery::of_type(OutreachEventType::MessageSent)
            .between(must_utc("2026-02-02T00:00:00Z"), must_utc("2026-02-03T12:00:00Z"));
        filters.lead_id = Some(lead("a"));

        let matched = must_ok(store.query(&workspace(), &filters));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].event_timestamp, must_utc("2026-02-03T10:00:00Z"));

        let limited = must_ok(store.query(&workspace(), &EventQuery::all().limited(2)));
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].event_type, OutreachEventType::MessageSent);
        assert_eq!(limited[0].lead_id, Some(lead("b")));
    }

    #[test]
    fn empty_workspace_yields_zero_kpis() {
        let kpis = replay_kpis(&[], must_utc(NOW), 7);
        assert_eq!(kpis, KpiSnapshot::default());
    }

    #[test]
    fn classification_resolves_reply_needing_action() {
        let mut inputs = vec![
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-07T09:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("a"), "2026-02-07T10:00:00Z"),
        ];
        let before = replay_kpis(&events_from(&inputs), must_utc(NOW), 7);
        assert_eq!(before.replies_needing_action, 1);

        inputs.push(input(
            OutreachEventType::ReplyClassified,
            Some("a"),
            "2026-02-07T10:30:00Z",
        ));
        let after = replay_kpis(&events_from(&inputs), must_utc(NOW), 7);
        assert_eq!(after.replies_needing_action, 0);
    }

    #[test]
    fn classification_before_reply_still_resolves_it() {
        let inputs = [
            input(
                OutreachEventType::ManualActionRequired,
                Some("a"),
                "2026-01-01T00:00:00Z",
            ),
            input(OutreachEventType::ReplyReceived, Some("a"), "2026-02-07T10:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("b"), "2026-02-07T10:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("b"), "2026-02-07T11:00:00Z"),
            input(OutreachEventType::ReplyReceived, None, "2026-02-07T11:00:00Z"),
        ];
        let breakdown = replay_breakdown(&events_from(&inputs), must_utc(NOW), 7);
        assert_eq!(
            breakdown.needing_action_leads,
            BTreeSet::from([lead("b")])
        );
    }

    #[test]
    fn reply_rate_counts_distinct_replying_leads() {
        let inputs = [
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-06T09:00:00Z"),
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-06T10:00:00Z"),
            input(OutreachEventType::MessageSent, Some("b"), "2026-02-05T09:00:00Z"),
            input(OutreachEventType::MessageSent, Some("c"), "2026-02-04T09:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("a"), "2026-02-06T12:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("a"), "2026-02-06T13:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("z"), "2026-02-06T13:00:00Z"),
        ];
        let kpis = replay_kpis(&events_from(&inputs), must_utc(NOW), 7);
        assert_eq!(kpis.reply_rate, 33);
    }

    #[test]
    fn reply_rate_ignores_sends_and_replies_outside_window() {
        let inputs = [
            input(OutreachEventType::MessageSent, Some("a"), "2026-01-20T09:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("a"), "2026-02-06T09:00:00Z"),
            input(OutreachEventType::MessageSent, Some("b"), "2026-02-06T09:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("b"), "2026-01-20T09:00:00Z"),
        ];
        let breakdown = replay_breakdown(&events_from(&inputs), must_utc(NOW), 7);
        assert_eq!(breakdown.sent_leads, BTreeSet::from([lead("b")]));
        assert!(breakdown.replied_leads.is_empty());
        assert_eq!(breakdown.snapshot().reply_rate, 0);
    }

    #[test]
    fn today_sends_use_local_midnight_of_now() {
        let inputs = [
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-06T23:30:00Z"),
            input(OutreachEventType::MessageSent, Some("b"), "2026-02-07T00:00:00Z"),
            input(OutreachEventType::MessageSent, None, "2026-02-07T14:59:59Z"),
            input(OutreachEventType::MessageFailed, Some("d"), "2026-02-07T10:00:00Z"),
        ];
        let events = events_from(&inputs);

        assert_eq!(replay_kpis(&events, must_utc(NOW), 7).today_sends, 2);

        let plus_one = must_ok(UtcOffset::from_hms(1, 0, 0));
        let local_now = must_utc(NOW).to_offset(plus_one);
        assert_eq!(replay_kpis(&events, local_now, 7).today_sends, 3);
    }

    #[test]
    fn today_sends_include_sends_stamped_after_now() {
        let inputs = [
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-07T16:00:00Z"),
            input(OutreachEventType::MessageSent, None, "2026-02-07T15:00:01Z"),
        ];
        let events = events_from(&inputs);

        let kpis = replay_kpis(&events, must_utc(NOW), 7);
        assert_eq!(kpis.today_sends, 2);

        let window = ReplayWindow::new(must_utc(NOW), 7);
        assert!(window.since_local_midnight(must_utc("2026-02-08T01:00:00Z")));
        assert!(!window.on_local_day(must_utc("2026-02-08T00:00:00Z")));
        assert!(window.on_local_day(must_utc("2026-02-07T23:59:59Z")));
    }

    #[test]
    fn engine_reads_now_in_configured_offset() {
        let mut store = InMemoryEventStore::new();
        must_ok(store.append_batch(&[
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-07T03:00:00Z"),
            input(OutreachEventType::MessageSent, Some("b"), "2026-02-07T06:00:00Z"),
        ]));

        let utc = MetricsConfig::v1();
        let utc_kpis = must_ok(MetricsEngine::new(&store, &utc).compute(&workspace(), must_utc(NOW)));
        assert_eq!(utc_kpis.today_sends, 2);

        let mut eastern = MetricsConfig::v1();
        eastern.utc_offset_minutes = -300;
        let engine = MetricsEngine::new(&store, &eastern);
        assert_eq!(
            must_ok(engine.local_now(must_utc(NOW))).offset().whole_hours(),
            -5
        );
        // Local midnight is 05:00Z, so the 03:00Z send belongs to yesterday.
        let eastern_kpis = must_ok(engine.compute(&workspace(), must_utc(NOW)));
        assert_eq!(eastern_kpis.today_sends, 1);
    }

    #[test]
    fn replay_is_deterministic_for_fixed_now() {
        let inputs = [
            input(OutreachEventType::MessageSent, Some("a"), "2026-02-07T09:00:00Z"),
            input(OutreachEventType::ReplyReceived, Some("a"), "2026-02-07T10:00:00Z"),
            input(OutreachEventType::MessageSent, Some("b"), "2026-02-03T09:00:00Z"),
        ];
        let events = events_from(&inputs);
        let mut reversed = events.clone();
        reversed.reverse();

        let first = replay_breakdown(&events, must_utc(NOW), 7);
        let second = replay_breakdown(&events, must_utc(NOW), 7);
        let third = replay_breakdown(&reversed, must_utc(NOW), 7);
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn reply_rate_rounds_half_up() {
        assert_eq!(reply_rate_percent(0, 0), 0);
        assert_eq!(reply_rate_percent(1, 3), 33);
        assert_eq!(reply_rate_percent(2, 3), 67);
        assert_eq!(reply_rate_percent(1, 8), 13);
        assert_eq!(reply_rate_percent(1, 200), 1);
        assert_eq!(reply_rate_percent(5, 5), 100);
    }

    #[test]
    fn config_validation_rejects_out_of_bounds_values() {
        assert!(MetricsConfig::v1().validate().is_ok());

        let mut config = MetricsConfig::v1();
        config.reply_rate_window_days = 0;
        assert!(matches!(config.validate(), Err(OutreachError::Configuration(_))));

        let invalid = MetricsConfig::from_json(&json!({
            "config_version": 1,
            "reply_rate_window_days": 7,
            "utc_offset_minutes": 900,
            "default_daily_limit": 120
        }));
        assert!(matches!(invalid, Err(OutreachError::Configuration(_))));
    }

    #[test]
    fn engine_reports_not_found_for_disallowed_workspace() {
        let store = InMemoryEventStore::new();
        let mut config = MetricsConfig::v1();
        config.allowed_workspaces = vec![workspace()];
        let engine = MetricsEngine::new(&store, &config);

        let allowed = must_ok(engine.compute(&workspace(), must_utc(NOW)));
        assert_eq!(allowed, KpiSnapshot::default());

        let denied = engine.compute(&must_ok(WorkspaceId::parse("ws-9")), must_utc(NOW));
        assert!(matches!(denied, Err(OutreachError::NotFound(_))));

        let open_engine = MetricsEngine::new(&store, &config).with_access(&AllowAllWorkspaces);
        assert!(open_engine
            .compute(&must_ok(WorkspaceId::parse("ws-9")), must_utc(NOW))
            .is_ok());
    }

    #[test]
    fn kpi_snapshot_serializes_dashboard_shape() {
        let snapshot = KpiSnapshot {
            today_sends: 4,
            replies_needing_action: 1,
            reply_rate: 33,
        };
        assert_eq!(
            must_ok(serde_json::to_value(snapshot)),
            json!({"todaySends": 4, "repliesNeedingAction": 1, "replyRate": 33})
        );
    }
}
