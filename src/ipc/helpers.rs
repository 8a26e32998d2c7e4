use crate::calc::{self, CalcError, ComponentScores, ScorePolicy};
use crate::db;
use crate::ipc::error::err;
use crate::ipc::handlers::setup::RESULTS_SETUP_KEY;
use crate::ipc::types::{AppState, Request};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Term and session are opaque keys scoping which records a call touches.
pub struct Scope {
    pub class_id: String,
    pub term: String,
    pub session: String,
}

pub fn required_scope(req: &Request) -> Result<Scope, serde_json::Value> {
    Ok(Scope {
        class_id: required_str(req, "classId")?,
        term: required_str(req, "term")?,
        session: required_str(req, "session")?,
    })
}

/// A component cell arrives as a number, `null`, an empty string, or is
/// absent. Anything else is rejected before it reaches the calculator.
pub fn parse_component(
    obj: &serde_json::Value,
    key: &str,
) -> Result<Option<f64>, CalcError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Ok(Some(n)),
            _ => Err(CalcError::new(
                "bad_params",
                format!("{} must be a number, null or empty", key),
            )
            .with_details(json!({ "field": key, "value": v }))),
        },
    }
}

pub fn parse_components(obj: &serde_json::Value) -> Result<ComponentScores, CalcError> {
    Ok(ComponentScores::new(
        parse_component(obj, "assessment1")?,
        parse_component(obj, "assessment2")?,
        parse_component(obj, "exam")?,
    ))
}

pub fn load_score_policy(conn: &Connection) -> Result<ScorePolicy, CalcError> {
    let section = db::settings_get_json(conn, RESULTS_SETUP_KEY)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    Ok(section
        .as_ref()
        .and_then(|v| v.get("scorePolicy"))
        .and_then(|v| v.as_str())
        .and_then(ScorePolicy::parse)
        .unwrap_or_default())
}

pub fn ensure_exists(
    conn: &Connection,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), CalcError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let exists: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(CalcError::new("not_found", format!("{} not found", what))
            .with_details(json!({ "id": id })));
    }
    Ok(())
}

pub fn cell_json(scores: &ComponentScores, cell: &calc::CellResult) -> serde_json::Value {
    let tier = cell.tier();
    json!({
        "assessment1": scores.assessment1,
        "assessment2": scores.assessment2,
        "exam": scores.exam,
        "total": cell.total,
        "grade": cell.grade,
        "tier": tier.as_str(),
        "visualState": tier.visual_state()
    })
}
