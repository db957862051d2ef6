//! Dashboard orchestration above the replay engine.
//!
//! The engine answers "what are the KPIs"; this layer combines them with
//! host-supplied context into the payload the dashboard renders, and owns the
//! display-layer substitution of neutral values when data is unavailable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    replay_breakdown, CampaignId, EventStore, KpiSnapshot, MetricsEngine, OutreachError,
    OutreachEvent, OutreachEventType, ReplayWindow, WorkspaceId,
};

const MAX_NEXT_ACTIONS: usize = 5;
const MAX_CAMPAIGN_SNAPSHOTS: usize = 5;
const DEFAULT_EXECUTION_MODE: &str = "Manual";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum SystemStatus {
    Healthy,
    Throttled,
    Paused,
    Error,
}

impl SystemStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Throttled => "Throttled",
            Self::Paused => "Paused",
            Self::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PausedCampaign {
    pub campaign_id: CampaignId,
    pub name: String,
    pub active_enrollments: u64,
}

/// Inputs owned by the host, not derivable from the event log.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemContext {
    pub active_campaigns: u32,
    pub daily_limit: u32,
    pub lead_count: u64,
    pub execution_mode: String,
    pub paused_campaign: Option<PausedCampaign>,
    /// Campaign names and queue depth, owned by the campaign controller.
    #[serde(default)]
    pub campaigns: Vec<CampaignDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDetail {
    pub campaign_id: CampaignId,
    pub name: String,
    pub queue_remaining: u64,
}

impl SystemContext {
    #[must_use]
    pub fn with_daily_limit(daily_limit: u32) -> Self {
        Self {
            active_campaigns: 0,
            daily_limit,
            lead_count: 0,
            execution_mode: DEFAULT_EXECUTION_MODE.to_string(),
            paused_campaign: None,
            campaigns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_send_at: Option<OffsetDateTime>,
    pub cooldown_active: bool,
    pub errors_last_24h: u64,
    pub captcha_detected: bool,
    pub automation_method: String,
}

impl SystemHealth {
    #[must_use]
    pub fn idle(automation_method: &str) -> Self {
        Self {
            last_send_at: None,
            cooldown_active: false,
            errors_last_24h: 0,
            captcha_detected: false,
            automation_method: automation_method.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSnapshot {
    pub campaign_id: CampaignId,
    pub name: String,
    pub status: CampaignStatus,
    pub queue_remaining: u64,
    pub sends_today: u64,
    pub replies_today: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NextAction {
    pub priority: u8,
    pub title: String,
    pub action: String,
    pub url: String,
}

impl NextAction {
    fn new(priority: u8, title: String, action: &str, url: &str) -> Self {
        Self {
            priority,
            title,
            action: action.to_string(),
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardKpis {
    pub today_sends: u64,
    pub daily_limit: u32,
    pub replies_needing_action: u64,
    pub reply_rate: u32,
    pub system_status: SystemStatus,
    pub system_status_reason: String,
    pub send_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub kpis: DashboardKpis,
    pub next_actions: Vec<NextAction>,
    pub campaign_snapshots: Vec<CampaignSnapshot>,
    pub system_health: SystemHealth,
}

impl DashboardStats {
    /// Zeroed payload shown when KPIs cannot be computed.
    #[must_use]
    pub fn neutral(reason: &str, default_daily_limit: u32) -> Self {
        let next_actions = if reason == NO_WORKSPACE_REASON {
            vec![NextAction::new(
                1,
                "Complete workspace setup".to_string(),
                "setup",
                "/dashboard/settings",
            )]
        } else {
            Vec::new()
        };

        Self {
            kpis: DashboardKpis {
                today_sends: 0,
                daily_limit: default_daily_limit,
                replies_needing_action: 0,
                reply_rate: 0,
                system_status: SystemStatus::Paused,
                system_status_reason: reason.to_string(),
                send_percentage: 0.0,
            },
            next_actions,
            campaign_snapshots: Vec::new(),
            system_health: SystemHealth::idle(DEFAULT_EXECUTION_MODE),
        }
    }
}

pub const NO_DATA_REASON: &str = "No data";
pub const NO_WORKSPACE_REASON: &str = "No workspace found";

/// Account health as of `now`. Events after `now` are ignored.
#[must_use]
pub fn derive_system_health(
    events: &[OutreachEvent],
    now: OffsetDateTime,
    automation_method: &str,
) -> SystemHealth {
    let day_ago = now - Duration::hours(24);
    let mut health = SystemHealth::idle(automation_method);
    let mut latest_throttle: Option<(OffsetDateTime, i64, bool)> = None;

    for event in events.iter().filter(|event| event.event_timestamp <= now) {
        let recent = event.event_timestamp >= day_ago;
        match event.event_type {
            OutreachEventType::MessageSent => {
                if health
                    .last_send_at
                    .map_or(true, |last| event.event_timestamp > last)
                {
                    health.last_send_at = Some(event.event_timestamp);
                }
            }
            OutreachEventType::MessageFailed if recent => health.errors_last_24h += 1,
            OutreachEventType::CaptchaDetected if recent => health.captcha_detected = true,
            OutreachEventType::AutomationThrottled | OutreachEventType::AutomationResumed => {
                let key = (event.event_timestamp, event.event_seq);
                if latest_throttle.map_or(true, |(at, seq, _)| key > (at, seq)) {
                    latest_throttle = Some((
                        event.event_timestamp,
                        event.event_seq,
                        event.event_type == OutreachEventType::AutomationThrottled,
                    ));
                }
            }
            _ => {}
        }
    }

    health.cooldown_active = latest_throttle.is_some_and(|(_, _, throttled)| throttled);
    health
}

/// Per-campaign activity for the local day of `now`, at most five campaigns
/// ordered by id. Campaigns named in `details` appear even without events;
/// unnamed campaigns fall back to their id.
#[must_use]
pub fn campaign_snapshots(
    events: &[OutreachEvent],
    now: OffsetDateTime,
    details: &[CampaignDetail],
) -> Vec<CampaignSnapshot> {
    #[derive(Default)]
    struct Tally {
        sends_today: u64,
        replies_today: u64,
        latest_toggle: Option<(OffsetDateTime, i64, bool)>,
    }

    let window = ReplayWindow::new(now, 1);
    let mut tallies: BTreeMap<CampaignId, Tally> = details
        .iter()
        .map(|detail| (detail.campaign_id.clone(), Tally::default()))
        .collect();

    for event in events {
        let Some(campaign_id) = &event.campaign_id else {
            continue;
        };
        let tally = tallies.entry(campaign_id.clone()).or_default();
        let today = window.on_local_day(event.event_timestamp);
        match event.event_type {
            OutreachEventType::MessageSent if today => tally.sends_today += 1,
            OutreachEventType::ReplyReceived if today => tally.replies_today += 1,
            // Pause state only reflects toggles that already happened.
            OutreachEventType::CampaignPaused | OutreachEventType::CampaignResumed
                if event.event_timestamp <= now =>
            {
                let key = (event.event_timestamp, event.event_seq);
                if tally
                    .latest_toggle
                    .map_or(true, |(at, seq, _)| key > (at, seq))
                {
                    tally.latest_toggle = Some((
                        event.event_timestamp,
                        event.event_seq,
                        event.event_type == OutreachEventType::CampaignPaused,
                    ));
                }
            }
            _ => {}
        }
    }

    tallies
        .into_iter()
        .take(MAX_CAMPAIGN_SNAPSHOTS)
        .map(|(campaign_id, tally)| {
            let detail = details
                .iter()
                .find(|detail| detail.campaign_id == campaign_id);
            CampaignSnapshot {
                name: detail.map_or_else(|| campaign_id.to_string(), |detail| detail.name.clone()),
                queue_remaining: detail.map_or(0, |detail| detail.queue_remaining),
                campaign_id,
                status: if tally.latest_toggle.is_some_and(|(_, _, paused)| paused) {
                    CampaignStatus::Paused
                } else {
                    CampaignStatus::Active
                },
                sends_today: tally.sends_today,
                replies_today: tally.replies_today,
            }
        })
        .collect()
}

#[must_use]
pub fn decide_system_status(
    kpis: &KpiSnapshot,
    health: &SystemHealth,
    context: &SystemContext,
) -> (SystemStatus, String) {
    if health.captcha_detected {
        return (
            SystemStatus::Error,
            "Captcha detected in the last 24 hours".to_string(),
        );
    }
    if health.cooldown_active {
        return (
            SystemStatus::Throttled,
            "Automation cooldown active".to_string(),
        );
    }
    if context.daily_limit > 0 && kpis.today_sends >= u64::from(context.daily_limit) {
        return (
            SystemStatus::Throttled,
            format!("Daily limit of {} reached", context.daily_limit),
        );
    }
    if context.active_campaigns == 0 {
        return (SystemStatus::Paused, "No active campaigns".to_string());
    }
    (
        SystemStatus::Healthy,
        format!("{} active campaigns", context.active_campaigns),
    )
}

#[must_use]
pub fn next_actions(
    kpis: &KpiSnapshot,
    context: &SystemContext,
    followups_today: u64,
) -> Vec<NextAction> {
    let mut actions = Vec::new();

    if context.lead_count == 0 {
        actions.push(NextAction::new(
            1,
            "Import contacts to unlock campaigns".to_string(),
            "import_contacts",
            "/dashboard/leads",
        ));
    }

    if context.daily_limit == 0 {
        actions.push(NextAction::new(
            2,
            "Configure daily send limit".to_string(),
            "configure_limit",
            "/dashboard/settings",
        ));
    }

    if kpis.replies_needing_action > 0 {
        let noun = if kpis.replies_needing_action == 1 {
            "reply"
        } else {
            "replies"
        };
        actions.push(NextAction::new(
            3,
            format!("{} {noun} waiting review", kpis.replies_needing_action),
            "review_replies",
            "/dashboard/inbox",
        ));
    }

    if let Some(paused) = context
        .paused_campaign
        .as_ref()
        .filter(|paused| paused.active_enrollments > 0)
    {
        actions.push(NextAction {
            priority: 4,
            title: format!(
                "Campaign \"{}\" paused with {} active enrollments",
                paused.name, paused.active_enrollments
            ),
            action: "resume_campaign".to_string(),
            url: format!("/dashboard/campaigns/{}", paused.campaign_id),
        });
    }

    if followups_today > 0 {
        actions.push(NextAction::new(
            5,
            format!("{followups_today} follow-ups scheduled today"),
            "view_followups",
            "/dashboard/tasks",
        ));
    }

    actions.sort_by_key(|action| action.priority);
    actions.truncate(MAX_NEXT_ACTIONS);
    actions
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn send_percentage(today_sends: u64, daily_limit: u32) -> f64 {
    if daily_limit == 0 {
        return 0.0;
    }
    today_sends as f64 / f64::from(daily_limit) * 100.0
}

/// Assembles the dashboard payload from one workspace history.
#[must_use]
pub fn build_dashboard(
    events: &[OutreachEvent],
    now: OffsetDateTime,
    reply_window_days: u16,
    context: &SystemContext,
) -> DashboardStats {
    let kpis = replay_breakdown(events, now, reply_window_days).snapshot();
    let health = derive_system_health(events, now, &context.execution_mode);
    let (system_status, system_status_reason) = decide_system_status(&kpis, &health, context);

    let followups_today = followups_scheduled_on_local_day(events, now);

    DashboardStats {
        kpis: DashboardKpis {
            today_sends: kpis.today_sends,
            daily_limit: context.daily_limit,
            replies_needing_action: kpis.replies_needing_action,
            reply_rate: kpis.reply_rate,
            system_status,
            system_status_reason,
            send_percentage: send_percentage(kpis.today_sends, context.daily_limit),
        },
        next_actions: next_actions(
            &kpis,
            context,
            followups_today,
        ),
        campaign_snapshots: campaign_snapshots(events, now, &context.campaigns),
        system_health: health,
    }
}

/// Follow-ups stamped within the calendar day of `now`, midnight to midnight.
#[must_use]
pub fn followups_scheduled_on_local_day(events: &[OutreachEvent], now: OffsetDateTime) -> u64 {
    let window = ReplayWindow::new(now, 1);
    let count = events
        .iter()
        .filter(|event| {
            event.event_type == OutreachEventType::FollowupScheduled
                && window.on_local_day(event.event_timestamp)
        })
        .count();
    u64::try_from(count).unwrap_or(u64::MAX)
}

/// Loads one workspace and builds its dashboard, substituting neutral values
/// when the workspace is unknown or its data cannot be read. `now` is read in
/// the configured reporting offset.
///
/// # Errors
/// Only [`OutreachError::Validation`] and [`OutreachError::Configuration`]
/// propagate.
pub fn load_dashboard<S: EventStore + ?Sized>(
    engine: &MetricsEngine<'_, S>,
    workspace_id: &WorkspaceId,
    now: OffsetDateTime,
    context: &SystemContext,
) -> Result<DashboardStats, OutreachError> {
    let default_daily_limit = engine.config().default_daily_limit;
    let now = engine.local_now(now)?;
    match engine.events(workspace_id) {
        Ok(events) => Ok(build_dashboard(
            &events,
            now,
            engine.config().reply_rate_window_days,
            context,
        )),
        Err(OutreachError::DataUnavailable(detail)) => {
            tracing::warn!(
                workspace_id = %workspace_id,
                detail = %detail,
                "event data unavailable; serving neutral dashboard"
            );
            Ok(DashboardStats::neutral(NO_DATA_REASON, default_daily_limit))
        }
        Err(OutreachError::NotFound(detail)) => {
            tracing::warn!(
                workspace_id = %workspace_id,
                detail = %detail,
                "workspace not found; serving neutral dashboard"
            );
            Ok(DashboardStats::neutral(
                NO_WORKSPACE_REASON,
                default_daily_limit,
            ))
        }
        Err(err) => Err(err),
    }
}
