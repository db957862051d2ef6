//! Deterministic test-event seeding.

use serde_json::json;
use time::{Duration, OffsetDateTime, Time};

use crate::{CampaignId, LeadId, OutreachError, OutreachEventInput, OutreachEventType, WorkspaceId};

const SEED_LEADS: usize = 20;
const HISTORY_DAYS: i64 = 7;
const SECONDS_PER_DAY: u64 = 86_400;

/// Parameters for one seeding run. The same plan always yields the same events.
#[derive(Debug, Clone)]
pub struct SeedPlan {
    pub workspace_id: WorkspaceId,
    pub campaign_id: CampaignId,
    pub now: OffsetDateTime,
    pub seed: u64,
}

impl SeedPlan {
    /// # Errors
    /// Returns [`OutreachError::Validation`] if the derived campaign id is invalid.
    pub fn new(
        workspace_id: WorkspaceId,
        now: OffsetDateTime,
        seed: u64,
    ) -> Result<Self, OutreachError> {
        Ok(Self {
            campaign_id: CampaignId::parse(&format!("{workspace_id}-seed-campaign"))?,
            workspace_id,
            now,
            seed,
        })
    }
}

/// FNV-1a over `(seed, counter)`; platform independent.
struct SeedStream {
    seed: u64,
    counter: u64,
}

impl SeedStream {
    fn new(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    fn next_u64(&mut self) -> u64 {
        self.counter += 1;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in self
            .seed
            .to_le_bytes()
            .into_iter()
            .chain(self.counter.to_le_bytes())
        {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }

    /// Uniform-enough value in `[0, bound)`; 0 when `bound` is 0.
    fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.next_u64() % bound
    }

    fn percent(&mut self, chance: u64) -> bool {
        self.below(100) < chance
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        let len = u64::try_from(items.len()).ok()?;
        let index = usize::try_from(self.below(len)).ok()?;
        items.get(index)
    }
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Generates a realistic week of activity ending at `plan.now`.
///
/// Every timestamp is at or before `now`: history days lie strictly before
/// today, today's sends fall between local midnight and `now`, and reply
/// follow-ups are clamped to `now`.
///
/// # Errors
/// Returns [`OutreachError::Validation`] if a derived lead id is invalid.
pub fn generate_seed_events(plan: &SeedPlan) -> Result<Vec<OutreachEventInput>, OutreachError> {
    let mut stream = SeedStream::new(plan.seed);
    let leads = (1..=SEED_LEADS)
        .map(|index| LeadId::parse(&format!("{}-lead-{index:02}", plan.workspace_id)))
        .collect::<Result<Vec<_>, _>>()?;

    let now = plan.now;
    let today_start = now.replace_time(Time::MIDNIGHT);
    let since_midnight = u64::try_from((now - today_start).whole_seconds()).unwrap_or(0);

    let base = |event_type: OutreachEventType, lead: &LeadId, at: OffsetDateTime| {
        OutreachEventInput::new(plan.workspace_id.clone(), event_type)
            .with_campaign(plan.campaign_id.clone())
            .with_lead(lead.clone())
            .at(at)
    };

    let mut events = Vec::new();

    for day in 1..=HISTORY_DAYS {
        let day_start = today_start - Duration::days(day);
        let messages = 10 + stream.below(20);
        for index in 0..messages {
            let Some(lead) = stream.pick(&leads) else {
                continue;
            };
            let sent_at = day_start + seconds(stream.below(SECONDS_PER_DAY));
            events.push(
                base(OutreachEventType::MessageSent, lead, sent_at)
                    .with_metadata("subject", json!(format!("Test message {index}"))),
            );

            if stream.percent(15) {
                let replied_at = (sent_at + Duration::hours(
                    i64::try_from(stream.below(24)).unwrap_or(0),
                ))
                .min(now);
                events.push(
                    base(OutreachEventType::ReplyReceived, lead, replied_at)
                        .with_metadata("body", json!("Thanks for reaching out!")),
                );

                if stream.percent(50) {
                    let classified_at = (replied_at + Duration::minutes(30)).min(now);
                    events.push(
                        base(OutreachEventType::ReplyClassified, lead, classified_at)
                            .with_metadata("classification", json!("interested")),
                    );
                }
            }

            if stream.percent(2) {
                events.push(
                    base(OutreachEventType::MessageFailed, lead, sent_at)
                        .with_metadata("error", json!("Bounce")),
                );
            }
        }
    }

    let today_messages = 20 + stream.below(40);
    for index in 0..today_messages {
        let Some(lead) = stream.pick(&leads) else {
            continue;
        };
        let sent_at = today_start + seconds(stream.below(since_midnight + 1));
        events.push(
            base(OutreachEventType::MessageSent, lead, sent_at)
                .with_metadata("subject", json!(format!("Today's message {index}"))),
        );
    }

    for _ in 0..3 {
        let Some(lead) = stream.pick(&leads) else {
            continue;
        };
        let replied_at = now - seconds(stream.below(3 * SECONDS_PER_DAY));
        events.push(
            base(OutreachEventType::ReplyReceived, lead, replied_at)
                .with_metadata("body", json!("Unclassified reply")),
        );
    }

    tracing::debug!(
        workspace_id = %plan.workspace_id,
        seed = plan.seed,
        events = events.len(),
        "generated seed events"
    );
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn plan(seed: u64) -> SeedPlan {
        must_ok(SeedPlan::new(
            must_ok(WorkspaceId::parse("ws-seed")),
            must_ok(parse_rfc3339_utc("2026-02-07T15:00:00Z")),
            seed,
        ))
    }

    #[test]
    fn same_seed_yields_same_events() {
        let first = must_ok(generate_seed_events(&plan(7)));
        let second = must_ok(generate_seed_events(&plan(7)));
        assert_eq!(first, second);

        let other = must_ok(generate_seed_events(&plan(8)));
        assert_ne!(first, other);
    }

    #[test]
    fn seeded_events_never_lie_after_now() {
        let plan = plan(42);
        let events = must_ok(generate_seed_events(&plan));
        assert!(events
            .iter()
            .all(|event| event.event_timestamp.is_some_and(|at| at <= plan.now)));

        let today_start = plan.now.replace_time(Time::MIDNIGHT);
        let today_sends = events
            .iter()
            .filter(|event| {
                event.event_type == OutreachEventType::MessageSent
                    && event.event_timestamp.is_some_and(|at| at >= today_start)
            })
            .count();
        assert!((20..60).contains(&today_sends));
    }
}
