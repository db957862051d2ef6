use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

const FIXTURE_NOW: &str = "2026-02-07T15:00:00Z";

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn schema_path(name: &str) -> PathBuf {
    repo_root().join("contracts/v1/schemas").join(name)
}

fn fixture_path(name: &str) -> PathBuf {
    repo_root().join("contracts/v1/fixtures").join(name)
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn fixture_db() -> PathBuf {
    let db_path =
        std::env::temp_dir().join(format!("outreach-integration-{}.sqlite3", Ulid::new()));
    let fixture = fixture_path("events.sample.json");
    let fixture_arg = fixture.to_string_lossy().to_string();
    let output = outreach(&db_path, &["events", "import", "--file", &fixture_arg]);
    assert!(
        output.status.success(),
        "fixture import failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    db_path
}

fn outreach(db_path: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_outreach"))
        .arg("--db")
        .arg(db_path)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to run outreach {args:?}: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("stdout is not JSON: {err}"))
}

#[test]
fn event_fixture_matches_payload_schema() {
    let events = read_json(&fixture_path("events.sample.json"));
    let items = events
        .as_array()
        .unwrap_or_else(|| panic!("event fixture must be an array"));
    assert!(!items.is_empty());

    let schema = schema_path("event-payload.schema.json");
    for item in items {
        assert_schema(&schema, item);
    }
}

#[test]
fn payload_schema_rejects_unknown_event_types() {
    let schema = read_json(&schema_path("event-payload.schema.json"));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile payload schema: {err}"));
    let bad = serde_json::json!({
        "workspaceId": "ws-1",
        "eventType": "message_opened"
    });
    assert!(!compiled.is_valid(&bad));

    let extra = serde_json::json!({
        "workspaceId": "ws-1",
        "eventType": "message_sent",
        "eventSeq": 4
    });
    assert!(!compiled.is_valid(&extra));
}

#[test]
fn cli_outputs_match_contract_schemas() {
    let db_path = fixture_db();

    for arm in ["replay", "declarative"] {
        let kpis = stdout_json(&outreach(
            &db_path,
            &["metrics", arm, "--workspace", "ws-fixture", "--now", FIXTURE_NOW],
        ));
        assert_schema(&schema_path("kpi-snapshot.schema.json"), &kpis);
    }

    let report = stdout_json(&outreach(
        &db_path,
        &[
            "metrics",
            "validate",
            "--workspace",
            "ws-fixture",
            "--now",
            FIXTURE_NOW,
            "--json",
        ],
    ));
    assert_schema(&schema_path("validation-report.schema.json"), &report);

    let dashboard = stdout_json(&outreach(
        &db_path,
        &[
            "dashboard",
            "show",
            "--workspace",
            "ws-fixture",
            "--now",
            FIXTURE_NOW,
            "--campaigns-json",
            r#"[{"campaignId":"camp-1","name":"Founders","queueRemaining":14}]"#,
        ],
    ));
    assert_schema(&schema_path("dashboard-stats.schema.json"), &dashboard);
    assert_eq!(
        dashboard["systemHealth"]["lastSendAt"],
        serde_json::json!("2026-02-07T11:00:00Z")
    );
    assert_eq!(
        dashboard["campaignSnapshots"][0],
        serde_json::json!({
            "campaignId": "camp-1",
            "name": "Founders",
            "status": "active",
            "queueRemaining": 14,
            "sendsToday": 2,
            "repliesToday": 1
        })
    );

    let config_arg = fixture_path("metrics-config.sample.json")
        .to_string_lossy()
        .to_string();
    let neutral = stdout_json(&outreach(
        &db_path,
        &[
            "--config",
            &config_arg,
            "dashboard",
            "show",
            "--workspace",
            "ws-unlisted",
            "--now",
            FIXTURE_NOW,
        ],
    ));
    assert_schema(&schema_path("dashboard-stats.schema.json"), &neutral);

    let _ = fs::remove_file(&db_path);
}

#[test]
fn database_written_by_cli_stays_append_only() {
    let db_path = fixture_db();
    let conn = rusqlite::Connection::open(&db_path)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", db_path.display()));

    let update = conn.execute(
        "UPDATE outreach_events SET event_type = 'message_failed' WHERE event_seq = 1",
        [],
    );
    let delete = conn.execute("DELETE FROM outreach_events", []);
    assert!(update.is_err(), "update should be rejected");
    assert!(delete.is_err(), "delete should be rejected");

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM outreach_events", [], |row| row.get(0))
        .unwrap_or_else(|err| panic!("failed to count events: {err}"));
    assert_eq!(count, 8);
    drop(conn);

    let _ = fs::remove_file(&db_path);
}
