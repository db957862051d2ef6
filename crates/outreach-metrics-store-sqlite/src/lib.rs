#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use outreach_metrics_core::{
    format_rfc3339, from_unix_nanos, now_utc, parse_rfc3339_utc, to_unix_nanos, CampaignId,
    DeclarativeMetrics, EventId, EventQuery, EventStore, KpiBreakdown, KpiSnapshot, LeadId,
    OutreachError, OutreachEvent, OutreachEventInput, OutreachEventType, WorkspaceId,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

const EVENTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_EVENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS outreach_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  workspace_id TEXT NOT NULL CHECK (length(workspace_id) > 0),
  campaign_id TEXT,
  lead_id TEXT,
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'message_queued',
      'message_sent',
      'message_failed',
      'reply_received',
      'reply_classified',
      'followup_scheduled',
      'followup_sent',
      'campaign_paused',
      'campaign_resumed',
      'automation_throttled',
      'automation_resumed',
      'captcha_detected',
      'manual_action_required'
    )
  ),
  event_ts_ns INTEGER NOT NULL,
  event_timestamp TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TRIGGER IF NOT EXISTS trg_outreach_events_no_update
BEFORE UPDATE ON outreach_events
BEGIN
  SELECT RAISE(FAIL, 'outreach_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_outreach_events_no_delete
BEFORE DELETE ON outreach_events
BEGIN
  SELECT RAISE(FAIL, 'outreach_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_outreach_events_workspace_ts
  ON outreach_events(workspace_id, event_ts_ns);
CREATE INDEX IF NOT EXISTS idx_outreach_events_workspace_type_ts
  ON outreach_events(workspace_id, event_type, event_ts_ns);
CREATE INDEX IF NOT EXISTS idx_outreach_events_workspace_lead_type
  ON outreach_events(workspace_id, lead_id, event_type);

CREATE VIEW IF NOT EXISTS v_pending_reply_leads AS
SELECT DISTINCT r.workspace_id, r.lead_id
FROM outreach_events r
WHERE r.event_type = 'reply_received'
  AND r.lead_id IS NOT NULL
  AND NOT EXISTS (
    SELECT 1 FROM outreach_events c
    WHERE c.workspace_id = r.workspace_id
      AND c.lead_id = r.lead_id
      AND c.event_type IN ('reply_classified', 'manual_action_required')
  );

CREATE VIEW IF NOT EXISTS v_replies_requiring_action AS
SELECT workspace_id, COUNT(*) AS replies_needing_action
FROM v_pending_reply_leads
GROUP BY workspace_id;
";

const EVENT_COLUMNS: &str = "event_seq, event_id, workspace_id, campaign_id, lead_id, \
     event_type, event_ts_ns, recorded_at, metadata_json";

// ?1 workspace, ?2 now (unix ns), ?3 offset seconds. Local midnight is derived
// with floor division so instants before 1970 land on the right day. Sends
// after now still count.
const TODAY_SENDS_CTE: &str = r"
WITH clock AS (
  SELECT ?2 AS now_ns,
         ((?2 - (((?2 % 1000000000) + 1000000000) % 1000000000)) / 1000000000) + ?3 AS local_s
),
bounds AS (
  SELECT (local_s - (((local_s % 86400) + 86400) % 86400) - ?3) * 1000000000 AS midnight_ns
  FROM clock
),
today_sends AS (
  SELECT e.event_id
  FROM outreach_events e, bounds b
  WHERE e.workspace_id = ?1
    AND e.event_type = 'message_sent'
    AND e.event_ts_ns >= b.midnight_ns
)";

// ?1 workspace, ?2 now (unix ns), ?3 window in days.
const REPLY_WINDOW_CTE: &str = r"
WITH window_bounds AS (
  SELECT ?2 - (?3 * 86400000000000) AS start_ns, ?2 AS end_ns
),
sent AS (
  SELECT DISTINCT e.lead_id
  FROM outreach_events e, window_bounds w
  WHERE e.workspace_id = ?1
    AND e.event_type = 'message_sent'
    AND e.lead_id IS NOT NULL
    AND e.event_ts_ns BETWEEN w.start_ns AND w.end_ns
),
replied AS (
  SELECT DISTINCT e.lead_id
  FROM outreach_events e, window_bounds w
  WHERE e.workspace_id = ?1
    AND e.event_type = 'reply_received'
    AND e.lead_id IS NOT NULL
    AND e.event_ts_ns BETWEEN w.start_ns AND w.end_ns
),
replied_sent AS (
  SELECT lead_id FROM sent WHERE lead_id IN (SELECT lead_id FROM replied)
)";

pub struct SqliteEventStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkspaceSummary {
    pub workspace_id: String,
    pub event_count: u64,
    pub first_event_at: String,
    pub last_event_at: String,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_EVENTS_V1)
            .context("failed to apply outreach_events schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![EVENTS_MIGRATION_VERSION, now],
            )
            .context("failed to register outreach_events schema migration")?;

        if inserted > 0 {
            tracing::info!(
                version = EVENTS_MIGRATION_VERSION,
                "applied outreach_events schema"
            );
        }

        Ok(())
    }

    /// Appends one event and returns the stored record.
    pub fn append_event(
        &mut self,
        input: &OutreachEventInput,
    ) -> Result<OutreachEvent, OutreachError> {
        input.validate()?;

        let mut event = input.to_event(0, EventId::generate(), now_utc());
        event.event_seq = insert_event(&self.conn, &event)?;

        tracing::debug!(
            workspace_id = %event.workspace_id,
            event_type = event.event_type.as_str(),
            event_seq = event.event_seq,
            "appended outreach event"
        );
        Ok(event)
    }

    /// Appends every input in a single transaction. Inputs are validated
    /// before the transaction opens; any insert failure rolls back the batch.
    pub fn append_events(
        &mut self,
        inputs: &[OutreachEventInput],
    ) -> Result<Vec<OutreachEvent>, OutreachError> {
        for (index, input) in inputs.iter().enumerate() {
            input.validate().map_err(|err| {
                OutreachError::Validation(format!("batch item {index} rejected: {err}"))
            })?;
        }

        let recorded_at = now_utc();
        let tx = self
            .conn
            .transaction()
            .map_err(|err| unavailable("failed to start batch transaction", &err))?;

        let mut events = Vec::with_capacity(inputs.len());
        for input in inputs {
            let mut event = input.to_event(0, EventId::generate(), recorded_at);
            event.event_seq = insert_event(&tx, &event)?;
            events.push(event);
        }

        tx.commit()
            .map_err(|err| unavailable("failed to commit batch transaction", &err))?;

        tracing::debug!(events = events.len(), "appended outreach event batch");
        Ok(events)
    }

    pub fn list_events(
        &self,
        workspace_id: &WorkspaceId,
        filters: &EventQuery,
    ) -> Result<Vec<OutreachEvent>, OutreachError> {
        filters.validate()?;

        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM outreach_events WHERE workspace_id = ?");
        let mut values = vec![SqlValue::Text(workspace_id.as_str().to_string())];

        if let Some(event_type) = filters.event_type {
            sql.push_str(" AND event_type = ?");
            values.push(SqlValue::Text(event_type.as_str().to_string()));
        }
        if let Some(campaign_id) = &filters.campaign_id {
            sql.push_str(" AND campaign_id = ?");
            values.push(SqlValue::Text(campaign_id.as_str().to_string()));
        }
        if let Some(lead_id) = &filters.lead_id {
            sql.push_str(" AND lead_id = ?");
            values.push(SqlValue::Text(lead_id.as_str().to_string()));
        }
        if let Some(start_time) = filters.start_time {
            sql.push_str(" AND event_ts_ns >= ?");
            values.push(SqlValue::Integer(to_unix_nanos(start_time)?));
        }
        if let Some(end_time) = filters.end_time {
            sql.push_str(" AND event_ts_ns <= ?");
            values.push(SqlValue::Integer(to_unix_nanos(end_time)?));
        }

        sql.push_str(" ORDER BY event_ts_ns DESC, event_seq DESC");
        if let Some(limit) = filters.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| unavailable("failed to prepare event query", &err))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), parse_event_row)
            .map_err(|err| unavailable("failed to query outreach events", &err))?;
        let events = collect_rows(rows)?;

        tracing::debug!(
            workspace_id = %workspace_id,
            events = events.len(),
            "queried outreach events"
        );
        Ok(events)
    }

    pub fn count_events(&self, workspace_id: &WorkspaceId) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM outreach_events WHERE workspace_id = ?1",
                params![workspace_id.as_str()],
                |row| row.get(0),
            )
            .context("failed to count outreach events")?;
        u64::try_from(count).with_context(|| format!("invalid event count: {count}"))
    }

    pub fn workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace_id, COUNT(*), MIN(event_ts_ns), MAX(event_ts_ns)
             FROM outreach_events
             GROUP BY workspace_id
             ORDER BY workspace_id ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            let count: i64 = row.get(1)?;
            let first = from_unix_nanos(row.get(2)?).map_err(|err| anyhow!(err.to_string()))?;
            let last = from_unix_nanos(row.get(3)?).map_err(|err| anyhow!(err.to_string()))?;
            summaries.push(WorkspaceSummary {
                workspace_id: row.get(0)?,
                event_count: u64::try_from(count)
                    .with_context(|| format!("invalid event count: {count}"))?,
                first_event_at: format_rfc3339(first).map_err(|err| anyhow!(err.to_string()))?,
                last_event_at: format_rfc3339(last).map_err(|err| anyhow!(err.to_string()))?,
            });
        }

        Ok(summaries)
    }

    fn today_sends(
        &self,
        workspace_id: &WorkspaceId,
        now_ns: i64,
        offset_seconds: i64,
    ) -> Result<u64, OutreachError> {
        let count: i64 = self
            .conn
            .query_row(
                &format!("{TODAY_SENDS_CTE} SELECT COUNT(*) FROM today_sends"),
                params![workspace_id.as_str(), now_ns, offset_seconds],
                |row| row.get(0),
            )
            .map_err(|err| unavailable("failed to aggregate today's sends", &err))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn replies_needing_action(&self, workspace_id: &WorkspaceId) -> Result<u64, OutreachError> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT replies_needing_action FROM v_replies_requiring_action
                 WHERE workspace_id = ?1",
                params![workspace_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| unavailable("failed to read v_replies_requiring_action", &err))?;
        Ok(count.and_then(|value| u64::try_from(value).ok()).unwrap_or(0))
    }

    fn reply_rate(
        &self,
        workspace_id: &WorkspaceId,
        now_ns: i64,
        window_days: u16,
    ) -> Result<u32, OutreachError> {
        let rate: i64 = self
            .conn
            .query_row(
                &format!(
                    "{REPLY_WINDOW_CTE}
                     SELECT CASE
                       WHEN (SELECT COUNT(*) FROM sent) = 0 THEN 0
                       ELSE CAST(ROUND(100.0 * (SELECT COUNT(*) FROM replied_sent)
                                       / (SELECT COUNT(*) FROM sent)) AS INTEGER)
                     END"
                ),
                params![workspace_id.as_str(), now_ns, i64::from(window_days)],
                |row| row.get(0),
            )
            .map_err(|err| unavailable("failed to aggregate reply rate", &err))?;
        Ok(u32::try_from(rate).unwrap_or(0))
    }

    fn lead_set(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<BTreeSet<LeadId>, OutreachError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|err| unavailable("failed to prepare lead query", &err))?;
        let rows = stmt
            .query_map(params, |row| {
                let raw: String = row.get(0)?;
                LeadId::parse(&raw).map_err(|err| invalid_column(0, Type::Text, err.to_string()))
            })
            .map_err(|err| unavailable("failed to query lead set", &err))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl EventStore for SqliteEventStore {
    fn append(&mut self, input: &OutreachEventInput) -> Result<EventId, OutreachError> {
        self.append_event(input).map(|event| event.event_id)
    }

    fn append_batch(&mut self, inputs: &[OutreachEventInput]) -> Result<usize, OutreachError> {
        self.append_events(inputs).map(|events| events.len())
    }

    fn query(
        &self,
        workspace_id: &WorkspaceId,
        filters: &EventQuery,
    ) -> Result<Vec<OutreachEvent>, OutreachError> {
        self.list_events(workspace_id, filters)
    }
}

impl DeclarativeMetrics for SqliteEventStore {
    fn declarative_kpis(
        &self,
        workspace_id: &WorkspaceId,
        now: time::OffsetDateTime,
        reply_window_days: u16,
    ) -> Result<KpiSnapshot, OutreachError> {
        let now_ns = to_unix_nanos(now)?;
        let offset_seconds = i64::from(now.offset().whole_seconds());

        Ok(KpiSnapshot {
            today_sends: self.today_sends(workspace_id, now_ns, offset_seconds)?,
            replies_needing_action: self.replies_needing_action(workspace_id)?,
            reply_rate: self.reply_rate(workspace_id, now_ns, reply_window_days)?,
        })
    }

    fn declarative_breakdown(
        &self,
        workspace_id: &WorkspaceId,
        now: time::OffsetDateTime,
        reply_window_days: u16,
    ) -> Result<KpiBreakdown, OutreachError> {
        let now_ns = to_unix_nanos(now)?;
        let offset_seconds = i64::from(now.offset().whole_seconds());

        let mut stmt = self
            .conn
            .prepare(&format!("{TODAY_SENDS_CTE} SELECT event_id FROM today_sends"))
            .map_err(|err| unavailable("failed to prepare today's sends query", &err))?;
        let rows = stmt
            .query_map(
                params![workspace_id.as_str(), now_ns, offset_seconds],
                |row| {
                    let raw: String = row.get(0)?;
                    EventId::parse(&raw)
                        .map_err(|err| invalid_column(0, Type::Text, err.to_string()))
                },
            )
            .map_err(|err| unavailable("failed to query today's sends", &err))?;
        let today_send_event_ids = collect_rows(rows)?.into_iter().collect();

        let window_days = i64::from(reply_window_days);
        Ok(KpiBreakdown {
            today_send_event_ids,
            needing_action_leads: self.lead_set(
                "SELECT lead_id FROM v_pending_reply_leads WHERE workspace_id = ?1",
                params![workspace_id.as_str()],
            )?,
            sent_leads: self.lead_set(
                &format!("{REPLY_WINDOW_CTE} SELECT lead_id FROM sent"),
                params![workspace_id.as_str(), now_ns, window_days],
            )?,
            replied_leads: self.lead_set(
                &format!("{REPLY_WINDOW_CTE} SELECT lead_id FROM replied_sent"),
                params![workspace_id.as_str(), now_ns, window_days],
            )?,
        })
    }
}

fn insert_event(conn: &Connection, event: &OutreachEvent) -> Result<i64, OutreachError> {
    let metadata = serde_json::to_string(&event.metadata).map_err(|err| {
        OutreachError::Validation(format!("failed to serialize metadata: {err}"))
    })?;

    conn.execute(
        "INSERT INTO outreach_events(
            event_id, workspace_id, campaign_id, lead_id, event_type,
            event_ts_ns, event_timestamp, recorded_at, metadata_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.event_id.to_string(),
            event.workspace_id.as_str(),
            event.campaign_id.as_ref().map(|value| value.as_str()),
            event.lead_id.as_ref().map(|value| value.as_str()),
            event.event_type.as_str(),
            to_unix_nanos(event.event_timestamp)?,
            format_rfc3339(event.event_timestamp)?,
            format_rfc3339(event.recorded_at)?,
            metadata,
        ],
    )
    .map_err(|err| unavailable("failed to append outreach event", &err))?;

    Ok(conn.last_insert_rowid())
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutreachEvent> {
    let event_id_raw: String = row.get(1)?;
    let workspace_raw: String = row.get(2)?;
    let campaign_raw: Option<String> = row.get(3)?;
    let lead_raw: Option<String> = row.get(4)?;
    let event_type_raw: String = row.get(5)?;
    let event_ts_ns: i64 = row.get(6)?;
    let recorded_at_raw: String = row.get(7)?;
    let metadata_raw: String = row.get(8)?;

    let event_id = EventId::parse(&event_id_raw)
        .map_err(|err| invalid_column(1, Type::Text, err.to_string()))?;
    let workspace_id = WorkspaceId::parse(&workspace_raw)
        .map_err(|err| invalid_column(2, Type::Text, err.to_string()))?;
    let campaign_id = campaign_raw
        .as_deref()
        .map(CampaignId::parse)
        .transpose()
        .map_err(|err| invalid_column(3, Type::Text, err.to_string()))?;
    let lead_id = lead_raw
        .as_deref()
        .map(LeadId::parse)
        .transpose()
        .map_err(|err| invalid_column(4, Type::Text, err.to_string()))?;
    let event_type = OutreachEventType::parse(&event_type_raw).ok_or_else(|| {
        invalid_column(5, Type::Text, format!("invalid event_type: {event_type_raw}"))
    })?;
    let event_timestamp = from_unix_nanos(event_ts_ns)
        .map_err(|err| invalid_column(6, Type::Integer, err.to_string()))?;
    let recorded_at = parse_rfc3339_utc(&recorded_at_raw)
        .map_err(|err| invalid_column(7, Type::Text, err.to_string()))?;
    let metadata = match serde_json::from_str::<Value>(&metadata_raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(invalid_column(
                8,
                Type::Text,
                "metadata_json is not an object".to_string(),
            ))
        }
        Err(err) => {
            return Err(invalid_column(
                8,
                Type::Text,
                format!("invalid metadata_json: {err}"),
            ))
        }
    };

    Ok(OutreachEvent {
        event_seq: row.get(0)?,
        event_id,
        workspace_id,
        campaign_id,
        lead_id,
        event_type,
        event_timestamp,
        recorded_at,
        metadata,
    })
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn unavailable(action: &str, err: &rusqlite::Error) -> OutreachError {
    OutreachError::DataUnavailable(format!("{action}: {err}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, OutreachError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| unavailable("failed to decode row", &err))?);
    }
    Ok(values)
}
