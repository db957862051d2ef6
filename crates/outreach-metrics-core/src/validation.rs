use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    format_rfc3339, replay_breakdown, DeclarativeMetrics, EventId, EventStore, KpiBreakdown,
    KpiSnapshot, LeadId, MetricsConfig, MetricsEngine, OutreachError, WorkspaceId,
};

pub const VALIDATION_CONTRACT_VERSION: &str = "metrics_validation.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KpiMetric {
    TodaySends,
    RepliesNeedingAction,
    ReplyRate,
}

impl KpiMetric {
    pub const ALL: [Self; 3] = [Self::TodaySends, Self::RepliesNeedingAction, Self::ReplyRate];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TodaySends => "today_sends",
            Self::RepliesNeedingAction => "replies_needing_action",
            Self::ReplyRate => "reply_rate",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::TodaySends => "Today's Sends",
            Self::RepliesNeedingAction => "Replies Needing Action",
            Self::ReplyRate => "Reply Rate (7d)",
        }
    }

    fn value_of(self, snapshot: &KpiSnapshot) -> u64 {
        match self {
            Self::TodaySends => snapshot.today_sends,
            Self::RepliesNeedingAction => snapshot.replies_needing_action,
            Self::ReplyRate => u64::from(snapshot.reply_rate),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ComputationArm {
    Replay,
    Declarative,
}

/// One item counted by exactly one arm.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Divergence {
    pub counted_by: Option<ComputationArm>,
    pub lead_id: Option<LeadId>,
    pub event_id: Option<EventId>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetricComparison {
    pub metric: KpiMetric,
    pub now: String,
    pub replay_value: u64,
    pub declarative_value: u64,
    #[serde(rename = "match")]
    pub matched: bool,
    pub divergence: Option<Divergence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub contract_version: String,
    pub workspace_id: WorkspaceId,
    pub reply_window_days: u16,
    pub checked_instants: Vec<String>,
    pub results: Vec<MetricComparison>,
    pub passed: usize,
    pub failed: usize,
    pub healthy: bool,
}

impl ValidationReport {
    #[must_use]
    pub fn mismatches(&self) -> Vec<&MetricComparison> {
        self.results.iter().filter(|result| !result.matched).collect()
    }
}

/// Compares both arms for one instant.
///
/// `declarative_breakdown` is only consulted when a metric disagrees.
///
/// # Errors
/// Propagates a failure to load the declarative breakdown or to format `now`.
pub fn compare_kpis<F>(
    now: OffsetDateTime,
    replay: &KpiBreakdown,
    declarative: &KpiSnapshot,
    declarative_breakdown: F,
) -> Result<Vec<MetricComparison>, OutreachError>
where
    F: FnOnce() -> Result<KpiBreakdown, OutreachError>,
{
    let now_text = format_rfc3339(now)?;
    let replay_snapshot = replay.snapshot();
    let mut loader = Some(declarative_breakdown);
    let mut loaded: Option<KpiBreakdown> = None;

    let mut comparisons = Vec::with_capacity(KpiMetric::ALL.len());
    for metric in KpiMetric::ALL {
        let replay_value = metric.value_of(&replay_snapshot);
        let declarative_value = metric.value_of(declarative);
        let matched = replay_value == declarative_value;

        let divergence = if matched {
            None
        } else {
            if loaded.is_none() {
                if let Some(load) = loader.take() {
                    loaded = Some(load()?);
                }
            }
            loaded
                .as_ref()
                .map(|other| locate_divergence(metric, replay, other))
        };

        comparisons.push(MetricComparison {
            metric,
            now: now_text.clone(),
            replay_value,
            declarative_value,
            matched,
            divergence,
        });
    }
    Ok(comparisons)
}

fn locate_divergence(
    metric: KpiMetric,
    replay: &KpiBreakdown,
    declarative: &KpiBreakdown,
) -> Divergence {
    match metric {
        KpiMetric::TodaySends => first_difference(
            &replay.today_send_event_ids,
            &declarative.today_send_event_ids,
        )
        .map_or_else(
            || unexplained("send event sets agree"),
            |(arm, event_id)| Divergence {
                counted_by: Some(arm),
                lead_id: None,
                event_id: Some(event_id),
                detail: format!("message_sent {event_id} counted only by {}", arm_name(arm)),
            },
        ),
        KpiMetric::RepliesNeedingAction => lead_divergence(
            &replay.needing_action_leads,
            &declarative.needing_action_leads,
            "needing action",
        )
        .unwrap_or_else(|| unexplained("pending lead sets agree")),
        KpiMetric::ReplyRate => {
            lead_divergence(&replay.sent_leads, &declarative.sent_leads, "as sent in window")
                .or_else(|| {
                    lead_divergence(
                        &replay.replied_leads,
                        &declarative.replied_leads,
                        "as replied in window",
                    )
                })
                .unwrap_or_else(|| unexplained("lead sets agree; rounding differs"))
        }
    }
}

fn lead_divergence(
    replay: &BTreeSet<LeadId>,
    declarative: &BTreeSet<LeadId>,
    what: &str,
) -> Option<Divergence> {
    first_difference(replay, declarative).map(|(arm, lead_id)| Divergence {
        counted_by: Some(arm),
        detail: format!("lead {lead_id} counted {what} only by {}", arm_name(arm)),
        lead_id: Some(lead_id),
        event_id: None,
    })
}

fn first_difference<T: Ord + Clone>(
    replay: &BTreeSet<T>,
    declarative: &BTreeSet<T>,
) -> Option<(ComputationArm, T)> {
    replay
        .difference(declarative)
        .next()
        .map(|item| (ComputationArm::Replay, item.clone()))
        .or_else(|| {
            declarative
                .difference(replay)
                .next()
                .map(|item| (ComputationArm::Declarative, item.clone()))
        })
}

fn unexplained(detail: &str) -> Divergence {
    Divergence {
        counted_by: None,
        lead_id: None,
        event_id: None,
        detail: detail.to_string(),
    }
}

fn arm_name(arm: ComputationArm) -> &'static str {
    match arm {
        ComputationArm::Replay => "replay",
        ComputationArm::Declarative => "declarative",
    }
}

/// Computes every KPI both ways for each instant and reports agreement.
///
/// Events are loaded once; each instant replays the same history. Both arms
/// read every instant in the configured reporting offset.
///
/// # Errors
/// [`OutreachError::Validation`] when `nows` is empty, otherwise any store or
/// authorization failure from either arm.
pub fn validate_workspace<S>(
    store: &S,
    workspace_id: &WorkspaceId,
    nows: &[OffsetDateTime],
    config: &MetricsConfig,
) -> Result<ValidationReport, OutreachError>
where
    S: EventStore + DeclarativeMetrics + ?Sized,
{
    if nows.is_empty() {
        return Err(OutreachError::Validation(
            "at least one instant is required".to_string(),
        ));
    }

    let engine = MetricsEngine::new(store, config);
    let events = engine.events(workspace_id)?;
    let window_days = config.reply_rate_window_days;

    let mut results = Vec::with_capacity(nows.len() * KpiMetric::ALL.len());
    let mut checked_instants = Vec::with_capacity(nows.len());
    for &instant in nows {
        let now = engine.local_now(instant)?;
        let replay = replay_breakdown(&events, now, window_days);
        let declarative = store.declarative_kpis(workspace_id, now, window_days)?;
        let comparisons = compare_kpis(now, &replay, &declarative, || {
            store.declarative_breakdown(workspace_id, now, window_days)
        })?;

        for comparison in comparisons.iter().filter(|comparison| !comparison.matched) {
            tracing::warn!(
                workspace_id = %workspace_id,
                metric = comparison.metric.as_str(),
                now = %comparison.now,
                replay = comparison.replay_value,
                declarative = comparison.declarative_value,
                detail = comparison
                    .divergence
                    .as_ref()
                    .map_or("", |divergence| divergence.detail.as_str()),
                "metric arms disagree"
            );
        }

        checked_instants.push(format_rfc3339(now)?);
        results.extend(comparisons);
    }

    let failed = results.iter().filter(|result| !result.matched).count();
    let passed = results.len() - failed;
    tracing::info!(
        workspace_id = %workspace_id,
        passed,
        failed,
        "metrics validation finished"
    );

    Ok(ValidationReport {
        contract_version: VALIDATION_CONTRACT_VERSION.to_string(),
        workspace_id: workspace_id.clone(),
        reply_window_days: window_days,
        checked_instants,
        results,
        passed,
        failed,
        healthy: failed == 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parse_rfc3339_utc, EventQuery, InMemoryEventStore, OutreachEvent, OutreachEventInput,
        OutreachEventType,
    };

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn lead(raw: &str) -> LeadId {
        must_ok(LeadId::parse(raw))
    }

    /// Declarative arm that reuses replay but can be skewed per metric.
    struct SkewedStore {
        inner: InMemoryEventStore,
        hide_lead: Option<LeadId>,
    }

    impl EventStore for SkewedStore {
        fn append(&mut self, input: &OutreachEventInput) -> Result<EventId, OutreachError> {
            self.inner.append(input)
        }

        fn append_batch(&mut self, inputs: &[OutreachEventInput]) -> Result<usize, OutreachError> {
            self.inner.append_batch(inputs)
        }

        fn query(
            &self,
            workspace_id: &WorkspaceId,
            filters: &EventQuery,
        ) -> Result<Vec<OutreachEvent>, OutreachError> {
            self.inner.query(workspace_id, filters)
        }
    }

    impl DeclarativeMetrics for SkewedStore {
        fn declarative_kpis(
            &self,
            workspace_id: &WorkspaceId,
            now: OffsetDateTime,
            reply_window_days: u16,
        ) -> Result<KpiSnapshot, OutreachError> {
            Ok(self
                .declarative_breakdown(workspace_id, now, reply_window_days)?
                .snapshot())
        }

        fn declarative_breakdown(
            &self,
            workspace_id: &WorkspaceId,
            now: OffsetDateTime,
            reply_window_days: u16,
        ) -> Result<KpiBreakdown, OutreachError> {
            let events = self.inner.query(workspace_id, &EventQuery::all())?;
            let mut breakdown = replay_breakdown(&events, now, reply_window_days);
            if let Some(hidden) = &self.hide_lead {
                breakdown.needing_action_leads.remove(hidden);
            }
            Ok(breakdown)
        }
    }

    fn seeded_store(hide_lead: Option<LeadId>) -> (SkewedStore, WorkspaceId) {
        let workspace = must_ok(WorkspaceId::parse("ws-1"));
        let mut inner = InMemoryEventStore::new();
        must_ok(inner.append_batch(&[
            OutreachEventInput::new(workspace.clone(), OutreachEventType::MessageSent)
                .with_lead(lead("a"))
                .at(must_ok(parse_rfc3339_utc("2026-02-07T09:00:00Z"))),
            OutreachEventInput::new(workspace.clone(), OutreachEventType::ReplyReceived)
                .with_lead(lead("a"))
                .at(must_ok(parse_rfc3339_utc("2026-02-07T10:00:00Z"))),
        ]));
        (SkewedStore { inner, hide_lead }, workspace)
    }

    #[test]
    fn agreeing_arms_produce_healthy_report() {
        let (store, workspace) = seeded_store(None);
        let now = must_ok(parse_rfc3339_utc("2026-02-07T15:00:00Z"));
        let report = must_ok(validate_workspace(
            &store,
            &workspace,
            &[now],
            &MetricsConfig::v1(),
        ));

        assert!(report.healthy);
        assert_eq!(report.passed, 3);
        assert_eq!(report.failed, 0);
        assert!(report.results.iter().all(|result| result.divergence.is_none()));
    }

    #[test]
    fn mismatch_names_the_diverging_lead() {
        let (store, workspace) = seeded_store(Some(lead("a")));
        let now = must_ok(parse_rfc3339_utc("2026-02-07T15:00:00Z"));
        let report = must_ok(validate_workspace(
            &store,
            &workspace,
            &[now],
            &MetricsConfig::v1(),
        ));

        assert!(!report.healthy);
        let mismatches = report.mismatches();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].metric, KpiMetric::RepliesNeedingAction);
        assert_eq!(mismatches[0].replay_value, 1);
        assert_eq!(mismatches[0].declarative_value, 0);

        let divergence = mismatches[0].divergence.clone();
        assert_eq!(
            divergence.as_ref().and_then(|item| item.lead_id.clone()),
            Some(lead("a"))
        );
        assert_eq!(
            divergence.and_then(|item| item.counted_by),
            Some(ComputationArm::Replay)
        );
    }

    #[test]
    fn declarative_breakdown_is_not_loaded_when_arms_agree() {
        let replay = KpiBreakdown::default();
        let now = must_ok(parse_rfc3339_utc("2026-02-07T15:00:00Z"));
        let comparisons = must_ok(compare_kpis(now, &replay, &KpiSnapshot::default(), || {
            Err(OutreachError::DataUnavailable("should not load".to_string()))
        }));
        assert!(comparisons.iter().all(|comparison| comparison.matched));
    }

    #[test]
    fn both_arms_read_instants_in_configured_offset() {
        let (mut store, workspace) = seeded_store(None);
        must_ok(store.append(
            &OutreachEventInput::new(workspace.clone(), OutreachEventType::MessageSent)
                .with_lead(lead("b"))
                .at(must_ok(parse_rfc3339_utc("2026-02-07T03:00:00Z"))),
        ));
        let now = must_ok(parse_rfc3339_utc("2026-02-07T15:00:00Z"));
        let mut config = MetricsConfig::v1();
        config.utc_offset_minutes = -300;

        let report = must_ok(validate_workspace(&store, &workspace, &[now], &config));
        assert!(report.healthy);
        assert_eq!(report.checked_instants, vec!["2026-02-07T15:00:00Z".to_string()]);
        let today_sends = report
            .results
            .iter()
            .find(|result| result.metric == KpiMetric::TodaySends)
            .map(|result| (result.replay_value, result.declarative_value));
        assert_eq!(today_sends, Some((1, 1)));
    }

    #[test]
    fn empty_instant_list_is_rejected() {
        let (store, workspace) = seeded_store(None);
        let result = validate_workspace(&store, &workspace, &[], &MetricsConfig::v1());
        assert!(matches!(result, Err(OutreachError::Validation(_))));
    }
}
