use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_scope, required_str, Scope};
use crate::ipc::types::{AppState, Request};
use crate::models::{self, ResultsContext};
use rusqlite::Connection;
use serde_json::{json, Value};

use super::setup;

/// Report toggles the shell honours when rendering cards and broadsheets.
struct ReportOptions {
    school_name: String,
    show_positions: bool,
    show_class_average: bool,
}

fn load_report_options(conn: &Connection) -> anyhow::Result<ReportOptions> {
    let section = match db::settings_get_json(conn, setup::REPORTS_SETUP_KEY)? {
        Some(v) => v,
        None => setup::default_reports_section(),
    };
    let defaults = setup::default_reports_section();
    let pick = |k: &str| section.get(k).cloned().unwrap_or_else(|| defaults[k].clone());
    Ok(ReportOptions {
        school_name: pick("schoolName").as_str().unwrap_or("").to_string(),
        show_positions: pick("showPositions").as_bool().unwrap_or(true),
        show_class_average: pick("showClassAverage").as_bool().unwrap_or(true),
    })
}

fn with_context<'a>(conn: &'a Connection, scope: &'a Scope) -> ResultsContext<'a> {
    ResultsContext {
        conn,
        class_id: &scope.class_id,
        term: &scope.term,
        session: &scope.session,
    }
}

fn handle_report_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match required_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let opts = match load_report_options(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let card = match models::report_card(&with_context(conn, &scope), &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut result = json!(card);
    if !opts.show_positions {
        result["position"] = Value::Null;
        result["positionLabel"] = Value::Null;
    }
    if !opts.show_class_average {
        if let Some(lines) = result["lines"].as_array_mut() {
            for line in lines {
                line["classAverage"] = Value::Null;
            }
        }
    }
    result["schoolName"] = json!(opts.school_name);
    ok(&req.id, result)
}

fn handle_broadsheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match required_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let opts = match load_report_options(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let sheet = match models::broadsheet(&with_context(conn, &scope)) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut result = json!(sheet);
    if !opts.show_positions {
        if let Some(rows) = result["rows"].as_array_mut() {
            for row in rows {
                row["position"] = Value::Null;
                row["positionLabel"] = Value::Null;
            }
        }
    }
    if !opts.show_class_average {
        if let Some(subjects) = result["subjects"].as_array_mut() {
            for subject in subjects {
                subject["classAverage"] = Value::Null;
            }
        }
    }
    result["schoolName"] = json!(opts.school_name);
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCard" => Some(handle_report_card(state, req)),
        "reports.broadsheet" => Some(handle_broadsheet(state, req)),
        _ => None,
    }
}
