use crate::calc::{self, CalcError, ComponentScores, ScorePolicy};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    cell_json, db_conn, ensure_exists, load_score_policy, now_stamp, parse_components,
    required_scope, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{self, ResultsContext};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const BULK_SAVE_MAX_ROWS: usize = 2000;

fn handle_results_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Works without a workspace; the default policy applies then.
    let policy = match state.db.as_ref() {
        Some(conn) => match load_score_policy(conn) {
            Ok(p) => p,
            Err(e) => return calc_err(&req.id, e),
        },
        None => ScorePolicy::default(),
    };

    let raw = match parse_components(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let scores = match calc::apply_policy(policy, raw) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let cell = calc::evaluate(scores);

    let mut result = cell_json(&scores, &cell);
    result["policy"] = json!(policy.as_str());
    ok(&req.id, result)
}

fn handle_results_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match required_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let ctx = ResultsContext {
        conn,
        class_id: &scope.class_id,
        term: &scope.term,
        session: &scope.session,
    };
    match models::entry_sheet(&ctx, &subject_id, include_inactive) {
        Ok(sheet) => ok(&req.id, json!(sheet)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_results_class_averages(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match required_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ResultsContext {
        conn,
        class_id: &scope.class_id,
        term: &scope.term,
        session: &scope.session,
    };
    match models::class_averages(&ctx) {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => calc_err(&req.id, e),
    }
}

struct SaveRow {
    student_id: String,
    scores: ComponentScores,
}

fn parse_save_rows(
    conn: &Connection,
    class_id: &str,
    policy: ScorePolicy,
    raw_rows: &[serde_json::Value],
) -> Result<Vec<SaveRow>, CalcError> {
    let mut enrolled: HashSet<String> = HashSet::new();
    {
        let mut stmt = conn
            .prepare("SELECT id FROM students WHERE class_id = ?")
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let ids = stmt
            .query_map([class_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        enrolled.extend(ids);
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(raw_rows.len());
    for (i, raw) in raw_rows.iter().enumerate() {
        let with_index = |e: CalcError| {
            let mut details = e.details.clone().unwrap_or_else(|| json!({}));
            details["rowIndex"] = json!(i);
            CalcError {
                details: Some(details),
                ..e
            }
        };

        let Some(student_id) = raw.get("studentId").and_then(|v| v.as_str()) else {
            return Err(with_index(CalcError::new(
                "bad_params",
                "row missing studentId",
            )));
        };
        if !enrolled.contains(student_id) {
            return Err(with_index(
                CalcError::new("not_found", "student not found in class")
                    .with_details(json!({ "studentId": student_id })),
            ));
        }
        if !seen.insert(student_id.to_string()) {
            return Err(with_index(
                CalcError::new("bad_params", "duplicate studentId in rows")
                    .with_details(json!({ "studentId": student_id })),
            ));
        }

        let parsed = parse_components(raw).map_err(with_index)?;
        let scores = calc::apply_policy(policy, parsed).map_err(with_index)?;
        out.push(SaveRow {
            student_id: student_id.to_string(),
            scores,
        });
    }
    Ok(out)
}

fn handle_results_bulk_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match required_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw_rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "rows must be an array", None);
    };
    if raw_rows.len() > BULK_SAVE_MAX_ROWS {
        return err(
            &req.id,
            "bad_params",
            format!("too many rows (max {})", BULK_SAVE_MAX_ROWS),
            Some(json!({ "rowCount": raw_rows.len(), "maxRows": BULK_SAVE_MAX_ROWS })),
        );
    }

    if let Err(e) = ensure_exists(conn, "classes", &scope.class_id, "class") {
        return calc_err(&req.id, e);
    }
    if let Err(e) = ensure_exists(conn, "subjects", &subject_id, "subject") {
        return calc_err(&req.id, e);
    }
    let policy = match load_score_policy(conn) {
        Ok(p) => p,
        Err(e) => return calc_err(&req.id, e),
    };

    // Validate the whole payload before touching the store; a save is all or nothing.
    let rows = match parse_save_rows(conn, &scope.class_id, policy, raw_rows) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let stamp = now_stamp();
    let mut saved = 0usize;
    let mut cleared = 0usize;
    for row in &rows {
        let s = row.scores;
        let result = if s.assessment1.is_none() && s.assessment2.is_none() && s.exam.is_none() {
            cleared += 1;
            tx.execute(
                "DELETE FROM subject_scores
                 WHERE student_id = ? AND subject_id = ? AND term = ? AND session = ?",
                (&row.student_id, &subject_id, &scope.term, &scope.session),
            )
        } else {
            saved += 1;
            let cell = calc::evaluate(s);
            tx.execute(
                "INSERT INTO subject_scores(
                   id, student_id, subject_id, class_id, term, session,
                   assessment1, assessment2, exam, total, grade, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, subject_id, term, session) DO UPDATE SET
                   class_id = excluded.class_id,
                   assessment1 = excluded.assessment1,
                   assessment2 = excluded.assessment2,
                   exam = excluded.exam,
                   total = excluded.total,
                   grade = excluded.grade,
                   updated_at = excluded.updated_at",
                (
                    Uuid::new_v4().to_string(),
                    &row.student_id,
                    &subject_id,
                    &scope.class_id,
                    &scope.term,
                    &scope.session,
                    s.assessment1,
                    s.assessment2,
                    s.exam,
                    cell.total,
                    &cell.grade,
                    &stamp,
                ),
            )
        };
        if let Err(e) = result {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "subject_scores", "studentId": row.student_id })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::info!(
        class_id = %scope.class_id,
        subject_id = %subject_id,
        term = %scope.term,
        session = %scope.session,
        saved,
        cleared,
        policy = policy.as_str(),
        "results saved"
    );

    let ctx = ResultsContext {
        conn,
        class_id: &scope.class_id,
        term: &scope.term,
        session: &scope.session,
    };
    match models::entry_sheet(&ctx, &subject_id, false) {
        Ok(sheet) => ok(
            &req.id,
            json!({
                "saved": saved,
                "cleared": cleared,
                "policy": policy.as_str(),
                "classAverage": sheet.class_average,
                "gradedCount": sheet.graded_count
            }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.evaluate" => Some(handle_results_evaluate(state, req)),
        "results.open" => Some(handle_results_open(state, req)),
        "results.classAverages" => Some(handle_results_class_averages(state, req)),
        "results.bulkSave" => Some(handle_results_bulk_save(state, req)),
        _ => None,
    }
}
