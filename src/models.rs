use crate::calc::{self, CalcError, ComponentScores, StudentSummary, SubjectTotal};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

/// Every model below is computed fresh from the stored component scores;
/// nothing derived is cached between calls.
#[derive(Debug, Clone)]
pub struct ResultsContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub term: &'a str,
    pub session: &'a str,
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub id: String,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
    pub admission_no: Option<String>,
    pub sort_order: i64,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct StoredScore {
    pub student_id: String,
    pub subject_id: String,
    pub components: ComponentScores,
    pub updated_at: Option<String>,
}

impl StoredScore {
    pub fn evaluate(&self) -> calc::CellResult {
        calc::evaluate(self.components)
    }
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassRef, CalcError> {
    let name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    let Some(name) = name else {
        return Err(CalcError::new("not_found", "class not found"));
    };
    Ok(ClassRef {
        id: class_id.to_string(),
        name,
    })
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> Result<SubjectRef, CalcError> {
    conn.query_row(
        "SELECT id, code, name FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            Ok(SubjectRef {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| CalcError::new("not_found", "subject not found"))
}

pub fn load_subjects(conn: &Connection) -> Result<Vec<SubjectRef>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id, code, name FROM subjects ORDER BY sort_order, code")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SubjectRef {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

pub fn load_roster(
    conn: &Connection,
    class_id: &str,
    include_inactive: bool,
) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, admission_no, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([class_id], |r| {
            let last_name: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let active: i64 = r.get(5)?;
            Ok(RosterStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last_name, first_name),
                admission_no: r.get(3)?,
                sort_order: r.get(4)?,
                active: active != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows
        .into_iter()
        .filter(|s| include_inactive || s.active)
        .collect())
}

pub fn load_scores(
    ctx: &ResultsContext<'_>,
    subject_id: Option<&str>,
) -> Result<Vec<StoredScore>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT student_id, subject_id, assessment1, assessment2, exam, updated_at
             FROM subject_scores
             WHERE class_id = ? AND term = ? AND session = ?
               AND (?4 IS NULL OR subject_id = ?4)",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(
            (ctx.class_id, ctx.term, ctx.session, subject_id),
            |r| {
                Ok(StoredScore {
                    student_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    components: ComponentScores::new(r.get(2)?, r.get(3)?, r.get(4)?),
                    updated_at: r.get(5)?,
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

/// Totals of enrolled (active) students only; these feed averages and
/// positions.
fn enrolled_totals(roster: &[RosterStudent], scores: &[StoredScore]) -> Vec<SubjectTotal> {
    let enrolled: HashMap<&str, bool> = roster
        .iter()
        .map(|s| (s.id.as_str(), s.active))
        .collect();
    scores
        .iter()
        .filter(|s| enrolled.get(s.student_id.as_str()).copied().unwrap_or(false))
        .map(|s| SubjectTotal {
            student_id: s.student_id.clone(),
            subject_id: s.subject_id.clone(),
            total: s.evaluate().total,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRow {
    pub student_id: String,
    pub display_name: String,
    pub admission_no: Option<String>,
    pub active: bool,
    pub assessment1: Option<f64>,
    pub assessment2: Option<f64>,
    pub exam: Option<f64>,
    pub total: Option<f64>,
    pub grade: String,
    pub tier: &'static str,
    pub visual_state: &'static str,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySheet {
    pub class: ClassRef,
    pub subject: SubjectRef,
    pub term: String,
    pub session: String,
    pub rows: Vec<EntryRow>,
    pub class_average: i64,
    pub graded_count: usize,
}

pub fn entry_sheet(
    ctx: &ResultsContext<'_>,
    subject_id: &str,
    include_inactive: bool,
) -> Result<EntrySheet, CalcError> {
    let class = load_class(ctx.conn, ctx.class_id)?;
    let subject = load_subject(ctx.conn, subject_id)?;
    let roster = load_roster(ctx.conn, ctx.class_id, true)?;
    let scores = load_scores(ctx, Some(subject_id))?;

    let by_student: HashMap<&str, &StoredScore> = scores
        .iter()
        .map(|s| (s.student_id.as_str(), s))
        .collect();

    let totals = enrolled_totals(&roster, &scores);
    let class_average = calc::class_average(subject_id, &totals);
    let graded_count = totals.iter().filter(|t| t.total.is_some()).count();

    let rows = roster
        .iter()
        .filter(|s| include_inactive || s.active)
        .map(|s| {
            let stored = by_student.get(s.id.as_str()).copied();
            let components = stored.map(|x| x.components).unwrap_or_default();
            let cell = calc::evaluate(components);
            let tier = cell.tier();
            EntryRow {
                student_id: s.id.clone(),
                display_name: s.display_name.clone(),
                admission_no: s.admission_no.clone(),
                active: s.active,
                assessment1: components.assessment1,
                assessment2: components.assessment2,
                exam: components.exam,
                total: cell.total,
                grade: cell.grade,
                tier: tier.as_str(),
                visual_state: tier.visual_state(),
                updated_at: stored.and_then(|x| x.updated_at.clone()),
            }
        })
        .collect();

    Ok(EntrySheet {
        class,
        subject,
        term: ctx.term.to_string(),
        session: ctx.session.to_string(),
        rows,
        class_average,
        graded_count,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub code: String,
    pub name: String,
    pub class_average: i64,
    pub graded_count: usize,
}

/// Subjects that have at least one record in scope, in catalogue order.
fn subjects_in_scope(
    conn: &Connection,
    scores: &[StoredScore],
) -> Result<Vec<SubjectRef>, CalcError> {
    let present: std::collections::HashSet<&str> =
        scores.iter().map(|s| s.subject_id.as_str()).collect();
    Ok(load_subjects(conn)?
        .into_iter()
        .filter(|s| present.contains(s.id.as_str()))
        .collect())
}

fn subject_averages(subjects: &[SubjectRef], totals: &[SubjectTotal]) -> Vec<SubjectAverage> {
    subjects
        .iter()
        .map(|s| SubjectAverage {
            subject_id: s.id.clone(),
            code: s.code.clone(),
            name: s.name.clone(),
            class_average: calc::class_average(&s.id, totals),
            graded_count: totals
                .iter()
                .filter(|t| t.subject_id == s.id && t.total.is_some())
                .count(),
        })
        .collect()
}

pub fn class_averages(ctx: &ResultsContext<'_>) -> Result<Vec<SubjectAverage>, CalcError> {
    load_class(ctx.conn, ctx.class_id)?;
    let roster = load_roster(ctx.conn, ctx.class_id, false)?;
    let scores = load_scores(ctx, None)?;
    let subjects = subjects_in_scope(ctx.conn, &scores)?;
    let totals = enrolled_totals(&roster, &scores);
    Ok(subject_averages(&subjects, &totals))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadsheetCell {
    pub subject_id: String,
    pub total: Option<f64>,
    pub grade: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadsheetRow {
    pub student_id: String,
    pub display_name: String,
    pub admission_no: Option<String>,
    pub cells: Vec<BroadsheetCell>,
    pub summary: StudentSummary,
    pub position: Option<usize>,
    pub position_label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadsheet {
    pub class: ClassRef,
    pub term: String,
    pub session: String,
    pub subjects: Vec<SubjectAverage>,
    pub rows: Vec<BroadsheetRow>,
    pub class_size: usize,
    pub ranked_count: usize,
}

/// Positions rank students on their unrounded mean over graded subjects.
pub fn broadsheet(ctx: &ResultsContext<'_>) -> Result<Broadsheet, CalcError> {
    let class = load_class(ctx.conn, ctx.class_id)?;
    let roster = load_roster(ctx.conn, ctx.class_id, false)?;
    let scores = load_scores(ctx, None)?;
    let subjects = subjects_in_scope(ctx.conn, &scores)?;
    let totals = enrolled_totals(&roster, &scores);

    let mut per_student: HashMap<&str, HashMap<&str, Option<f64>>> = HashMap::new();
    for t in &totals {
        per_student
            .entry(t.student_id.as_str())
            .or_default()
            .insert(t.subject_id.as_str(), t.total);
    }

    let mut rows: Vec<BroadsheetRow> = Vec::with_capacity(roster.len());
    let mut means: Vec<(String, Option<f64>)> = Vec::with_capacity(roster.len());
    for s in &roster {
        let taken = per_student.get(s.id.as_str());
        let cells: Vec<BroadsheetCell> = subjects
            .iter()
            .map(|sub| {
                let total = taken.and_then(|m| m.get(sub.id.as_str()).copied()).flatten();
                BroadsheetCell {
                    subject_id: sub.id.clone(),
                    total,
                    grade: calc::compute_grade(total).to_string(),
                }
            })
            .collect();
        let offered: Vec<Option<f64>> = subjects
            .iter()
            .filter_map(|sub| taken.and_then(|m| m.get(sub.id.as_str()).copied()))
            .collect();
        let summary = calc::student_summary(offered);
        let mean = if summary.subjects_graded > 0 {
            Some(summary.total_obtained / summary.subjects_graded as f64)
        } else {
            None
        };
        means.push((s.id.clone(), mean));
        rows.push(BroadsheetRow {
            student_id: s.id.clone(),
            display_name: s.display_name.clone(),
            admission_no: s.admission_no.clone(),
            cells,
            summary,
            position: None,
            position_label: None,
        });
    }

    let positions = calc::student_positions(&means);
    let ranked_count = positions.iter().filter(|p| p.position.is_some()).count();
    let by_id: HashMap<&str, &calc::Position> = positions
        .iter()
        .map(|p| (p.student_id.as_str(), p))
        .collect();
    for row in &mut rows {
        if let Some(p) = by_id.get(row.student_id.as_str()) {
            row.position = p.position;
            row.position_label = p.position_label.clone();
        }
    }

    Ok(Broadsheet {
        class,
        term: ctx.term.to_string(),
        session: ctx.session.to_string(),
        subjects: subject_averages(&subjects, &totals),
        class_size: roster.len(),
        ranked_count,
        rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardLine {
    pub subject_id: String,
    pub code: String,
    pub name: String,
    pub assessment1: Option<f64>,
    pub assessment2: Option<f64>,
    pub exam: Option<f64>,
    pub total: Option<f64>,
    pub grade: String,
    pub tier: &'static str,
    pub visual_state: &'static str,
    pub class_average: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub class: ClassRef,
    pub student: RosterStudent,
    pub term: String,
    pub session: String,
    pub lines: Vec<ReportCardLine>,
    pub summary: StudentSummary,
    pub position: Option<usize>,
    pub position_label: Option<String>,
    pub class_size: usize,
}

pub fn report_card(ctx: &ResultsContext<'_>, student_id: &str) -> Result<ReportCard, CalcError> {
    let sheet = broadsheet(ctx)?;
    let roster = load_roster(ctx.conn, ctx.class_id, true)?;
    let Some(student) = roster.into_iter().find(|s| s.id == student_id) else {
        return Err(CalcError::new("not_found", "student not found in class"));
    };

    let scores = load_scores(ctx, None)?;
    let subjects = load_subjects(ctx.conn)?;
    let averages: HashMap<&str, i64> = sheet
        .subjects
        .iter()
        .map(|a| (a.subject_id.as_str(), a.class_average))
        .collect();
    let mine: HashMap<&str, &StoredScore> = scores
        .iter()
        .filter(|s| s.student_id == student_id)
        .map(|s| (s.subject_id.as_str(), s))
        .collect();

    let lines: Vec<ReportCardLine> = subjects
        .iter()
        .filter_map(|sub| {
            let stored = mine.get(sub.id.as_str())?;
            let cell = stored.evaluate();
            let tier = cell.tier();
            Some(ReportCardLine {
                subject_id: sub.id.clone(),
                code: sub.code.clone(),
                name: sub.name.clone(),
                assessment1: stored.components.assessment1,
                assessment2: stored.components.assessment2,
                exam: stored.components.exam,
                total: cell.total,
                grade: cell.grade,
                tier: tier.as_str(),
                visual_state: tier.visual_state(),
                class_average: averages.get(sub.id.as_str()).copied().unwrap_or(0),
            })
        })
        .collect();

    let summary = calc::student_summary(lines.iter().map(|l| l.total));
    let row = sheet.rows.iter().find(|r| r.student_id == student_id);

    Ok(ReportCard {
        class: sheet.class.clone(),
        student,
        term: ctx.term.to_string(),
        session: ctx.session.to_string(),
        lines,
        summary,
        position: row.and_then(|r| r.position),
        position_label: row.and_then(|r| r.position_label.clone()),
        class_size: sheet.class_size,
    })
}
