use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const ASSESSMENT_MAX: f64 = 10.0;
pub const EXAM_MAX: f64 = 80.0;

/// One-decimal rounding used for student averages on report cards:
/// `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Half-up rounding to an integer. Matches `Math.round` for the
/// half-integer case (2.5 -> 3, -2.5 -> -2).
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScores {
    pub assessment1: Option<f64>,
    pub assessment2: Option<f64>,
    pub exam: Option<f64>,
}

impl ComponentScores {
    pub fn new(assessment1: Option<f64>, assessment2: Option<f64>, exam: Option<f64>) -> Self {
        Self {
            assessment1,
            assessment2,
            exam,
        }
    }
}

pub fn compute_total(
    assessment1: Option<f64>,
    assessment2: Option<f64>,
    exam: Option<f64>,
) -> Option<f64> {
    Some(assessment1? + assessment2? + exam?)
}

/// WAEC 9-point scale, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Grade {
    A1,
    B2,
    B3,
    C4,
    C5,
    C6,
    D7,
    E8,
    F9,
}

/// Inclusive lower bound of each band, evaluated high to low.
const GRADE_BANDS: [(f64, Grade); 8] = [
    (90.0, Grade::A1),
    (80.0, Grade::B2),
    (70.0, Grade::B3),
    (60.0, Grade::C4),
    (50.0, Grade::C5),
    (45.0, Grade::C6),
    (40.0, Grade::D7),
    (30.0, Grade::E8),
];

impl Grade {
    pub const ALL: [Grade; 9] = [
        Grade::A1,
        Grade::B2,
        Grade::B3,
        Grade::C4,
        Grade::C5,
        Grade::C6,
        Grade::D7,
        Grade::E8,
        Grade::F9,
    ];

    pub fn from_total(total: f64) -> Grade {
        GRADE_BANDS
            .iter()
            .find(|(min, _)| total >= *min)
            .map(|(_, g)| *g)
            .unwrap_or(Grade::F9)
    }

    pub fn parse(s: &str) -> Option<Grade> {
        Grade::ALL.iter().copied().find(|g| g.as_str() == s.trim())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::A1 => "A1",
            Grade::B2 => "B2",
            Grade::B3 => "B3",
            Grade::C4 => "C4",
            Grade::C5 => "C5",
            Grade::C6 => "C6",
            Grade::D7 => "D7",
            Grade::E8 => "E8",
            Grade::F9 => "F9",
        }
    }

    pub fn tier(self) -> GradeTier {
        match self {
            Grade::A1 | Grade::B2 | Grade::B3 => GradeTier::Distinction,
            Grade::C4 | Grade::C5 | Grade::C6 => GradeTier::Credit,
            Grade::D7 | Grade::E8 => GradeTier::Pass,
            Grade::F9 => GradeTier::Fail,
        }
    }
}

pub fn compute_grade(total: Option<f64>) -> &'static str {
    match total {
        Some(t) => Grade::from_total(t).as_str(),
        None => "",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GradeTier {
    #[serde(rename = "pass-distinction")]
    Distinction,
    #[serde(rename = "pass-credit")]
    Credit,
    #[serde(rename = "pass-pass")]
    Pass,
    #[serde(rename = "fail")]
    Fail,
}

impl GradeTier {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeTier::Distinction => "pass-distinction",
            GradeTier::Credit => "pass-credit",
            GradeTier::Pass => "pass-pass",
            GradeTier::Fail => "fail",
        }
    }

    pub fn visual_state(self) -> &'static str {
        match self {
            GradeTier::Distinction => "success",
            GradeTier::Credit => "warning",
            GradeTier::Pass => "caution",
            GradeTier::Fail => "danger",
        }
    }
}

/// Empty or unrecognised grades fall into the fail tier.
pub fn classify_grade(grade: &str) -> GradeTier {
    Grade::parse(grade)
        .map(Grade::tier)
        .unwrap_or(GradeTier::Fail)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellResult {
    pub total: Option<f64>,
    pub grade: String,
}

impl CellResult {
    pub fn tier(&self) -> GradeTier {
        classify_grade(&self.grade)
    }
}

pub fn evaluate(scores: ComponentScores) -> CellResult {
    let total = compute_total(scores.assessment1, scores.assessment2, scores.exam);
    CellResult {
        total,
        grade: compute_grade(total).to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScorePolicy {
    #[default]
    Permissive,
    Clamp,
    Reject,
}

impl ScorePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive" => Some(Self::Permissive),
            "clamp" => Some(Self::Clamp),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permissive => "permissive",
            Self::Clamp => "clamp",
            Self::Reject => "reject",
        }
    }
}

fn police_component(
    policy: ScorePolicy,
    field: &str,
    value: Option<f64>,
    max: f64,
) -> Result<Option<f64>, CalcError> {
    let Some(v) = value else {
        return Ok(None);
    };
    match policy {
        ScorePolicy::Permissive => Ok(Some(v)),
        ScorePolicy::Clamp => Ok(Some(v.clamp(0.0, max))),
        ScorePolicy::Reject => {
            if v.is_finite() && (0.0..=max).contains(&v) {
                Ok(Some(v))
            } else {
                Err(CalcError::new(
                    "out_of_range",
                    format!("{} must be in 0..={}", field, max),
                )
                .with_details(serde_json::json!({
                    "field": field,
                    "value": v,
                    "min": 0.0,
                    "max": max
                })))
            }
        }
    }
}

pub fn apply_policy(
    policy: ScorePolicy,
    scores: ComponentScores,
) -> Result<ComponentScores, CalcError> {
    Ok(ComponentScores {
        assessment1: police_component(policy, "assessment1", scores.assessment1, ASSESSMENT_MAX)?,
        assessment2: police_component(policy, "assessment2", scores.assessment2, ASSESSMENT_MAX)?,
        exam: police_component(policy, "exam", scores.exam, EXAM_MAX)?,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectTotal {
    pub student_id: String,
    pub subject_id: String,
    pub total: Option<f64>,
}

pub fn class_average(subject_id: &str, scores: &[SubjectTotal]) -> i64 {
    let mut sum = 0.0;
    let mut count: usize = 0;
    for s in scores.iter().filter(|s| s.subject_id == subject_id) {
        if let Some(t) = s.total {
            sum += t;
            count += 1;
        }
    }
    if count == 0 {
        return 0;
    }
    round_half_up(sum / (count as f64))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub student_id: String,
    pub total: Option<f64>,
    pub position: Option<usize>,
    pub position_label: Option<String>,
}

/// Competition ranking (1, 2, 2, 4) on descending total. Students with no
/// total come last and are unranked.
pub fn student_positions(totals: &[(String, Option<f64>)]) -> Vec<Position> {
    let mut ranked: Vec<(usize, &String, f64)> = totals
        .iter()
        .enumerate()
        .filter_map(|(i, (id, t))| t.map(|t| (i, id, t)))
        .collect();
    ranked.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let mut out = Vec::with_capacity(totals.len());
    let mut prev: Option<f64> = None;
    let mut pos = 0;
    for (n, (_, id, t)) in ranked.iter().enumerate() {
        if prev != Some(*t) {
            pos = n + 1;
            prev = Some(*t);
        }
        out.push(Position {
            student_id: (*id).clone(),
            total: Some(*t),
            position: Some(pos),
            position_label: Some(ordinal(pos)),
        });
    }
    for (id, t) in totals {
        if t.is_none() {
            out.push(Position {
                student_id: id.clone(),
                total: None,
                position: None,
                position_label: None,
            });
        }
    }
    out
}

pub fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub subjects_offered: usize,
    pub subjects_graded: usize,
    pub total_obtained: f64,
    pub average: f64,
}

pub fn student_summary<I>(totals: I) -> StudentSummary
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut offered = 0;
    let mut graded = 0;
    let mut sum = 0.0;
    for t in totals {
        offered += 1;
        if let Some(v) = t {
            graded += 1;
            sum += v;
        }
    }
    let average = if graded > 0 {
        round_off_1_decimal(sum / (graded as f64))
    } else {
        0.0
    };
    StudentSummary {
        subjects_offered: offered,
        subjects_graded: graded,
        total_obtained: sum,
        average,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn st(student: &str, subject: &str, total: Option<f64>) -> SubjectTotal {
        SubjectTotal {
            student_id: student.to_string(),
            subject_id: subject.to_string(),
            total,
        }
    }

    #[test]
    fn total_requires_every_component() {
        assert_eq!(compute_total(Some(5.0), Some(6.0), Some(70.0)), Some(81.0));
        assert_eq!(compute_total(None, Some(6.0), Some(70.0)), None);
        assert_eq!(compute_total(Some(5.0), None, Some(70.0)), None);
        assert_eq!(compute_total(Some(5.0), Some(6.0), None), None);
        assert_eq!(compute_total(None, None, None), None);
        assert_eq!(compute_grade(None), "");
    }

    #[test]
    fn grade_boundaries_are_inclusive_lower_bounds() {
        let cases = [
            (100.0, "A1"),
            (90.0, "A1"),
            (89.9, "B2"),
            (89.0, "B2"),
            (80.0, "B2"),
            (79.0, "B3"),
            (70.0, "B3"),
            (69.0, "C4"),
            (60.0, "C4"),
            (59.0, "C5"),
            (50.0, "C5"),
            (49.0, "C6"),
            (45.0, "C6"),
            (44.0, "D7"),
            (40.0, "D7"),
            (39.0, "E8"),
            (30.0, "E8"),
            (29.0, "F9"),
            (0.0, "F9"),
        ];
        for (total, want) in cases {
            assert_eq!(compute_grade(Some(total)), want, "total {}", total);
        }
    }

    #[test]
    fn grade_is_monotone_in_total() {
        let mut prev = Grade::from_total(0.0);
        for tenths in 1..=1000 {
            let g = Grade::from_total(tenths as f64 / 10.0);
            assert!(g <= prev, "grade got worse at {}", tenths);
            prev = g;
        }
    }

    #[test]
    fn classify_covers_every_grade_and_empty() {
        assert_eq!(classify_grade("A1"), GradeTier::Distinction);
        assert_eq!(classify_grade("B3"), GradeTier::Distinction);
        assert_eq!(classify_grade("C4"), GradeTier::Credit);
        assert_eq!(classify_grade("C6"), GradeTier::Credit);
        assert_eq!(classify_grade("D7"), GradeTier::Pass);
        assert_eq!(classify_grade("E8"), GradeTier::Pass);
        assert_eq!(classify_grade("F9"), GradeTier::Fail);
        assert_eq!(classify_grade(""), GradeTier::Fail);
        assert_eq!(classify_grade("Z9"), GradeTier::Fail);
        assert_eq!(classify_grade("a1 "), GradeTier::Fail);
        assert_eq!(GradeTier::Credit.visual_state(), "warning");
        assert_eq!(GradeTier::Pass.visual_state(), "caution");
    }

    #[test]
    fn permissive_policy_sums_suspicious_inputs() {
        let raw = ComponentScores::new(Some(35.0), Some(50.0), Some(0.0));
        let policed = apply_policy(ScorePolicy::Permissive, raw).expect("permissive");
        let cell = evaluate(policed);
        assert_eq!(cell.total, Some(85.0));
        assert_eq!(cell.grade, "B2");
    }

    #[test]
    fn clamp_and_reject_policies_enforce_ranges() {
        let raw = ComponentScores::new(Some(35.0), Some(-2.0), Some(95.0));
        let clamped = apply_policy(ScorePolicy::Clamp, raw).expect("clamp");
        assert_eq!(clamped, ComponentScores::new(Some(10.0), Some(0.0), Some(80.0)));

        let e = apply_policy(ScorePolicy::Reject, raw).expect_err("reject");
        assert_eq!(e.code, "out_of_range");

        let partial = ComponentScores::new(Some(4.0), None, None);
        assert_eq!(apply_policy(ScorePolicy::Reject, partial).expect("ok"), partial);
    }

    #[test]
    fn class_average_rounds_and_skips_nulls() {
        let scores = vec![
            st("ada", "m", Some(85.0)),
            st("bola", "m", Some(90.0)),
            st("chidi", "m", Some(70.0)),
            st("ada", "eng", Some(10.0)),
        ];
        assert_eq!(class_average("m", &scores), 82);

        let partial = vec![
            st("ada", "m", Some(85.0)),
            st("bola", "m", None),
            st("chidi", "m", Some(70.0)),
        ];
        assert_eq!(class_average("m", &partial), 78);

        assert_eq!(class_average("m", &[]), 0);
        let all_null = vec![st("ada", "m", None), st("bola", "m", None)];
        assert_eq!(class_average("m", &all_null), 0);
        assert_eq!(class_average("other", &scores), 0);
    }

    #[test]
    fn half_up_rounding() {
        assert_eq!(round_half_up(77.5), 78);
        assert_eq!(round_half_up(77.49), 77);
        assert_eq!(round_half_up(0.0), 0);
    }

    #[test]
    fn positions_share_ties_and_skip() {
        let totals = vec![
            ("a".to_string(), Some(250.0)),
            ("b".to_string(), Some(300.0)),
            ("c".to_string(), None),
            ("d".to_string(), Some(250.0)),
            ("e".to_string(), Some(100.0)),
        ];
        let p = student_positions(&totals);
        let got: Vec<(&str, Option<usize>)> =
            p.iter().map(|x| (x.student_id.as_str(), x.position)).collect();
        assert_eq!(
            got,
            vec![
                ("b", Some(1)),
                ("a", Some(2)),
                ("d", Some(2)),
                ("e", Some(4)),
                ("c", None)
            ]
        );
        assert_eq!(p[1].position_label.as_deref(), Some("2nd"));
    }

    #[test]
    fn ordinal_suffixes() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(13), "13th");
        assert_eq!(ordinal(21), "21st");
        assert_eq!(ordinal(112), "112th");
    }

    #[test]
    fn summary_averages_graded_subjects_only() {
        let s = student_summary(vec![Some(85.0), None, Some(70.0), Some(66.0)]);
        assert_eq!(s.subjects_offered, 4);
        assert_eq!(s.subjects_graded, 3);
        assert_eq!(s.total_obtained, 221.0);
        assert_eq!(s.average, 73.7);

        let empty = student_summary(Vec::<Option<f64>>::new());
        assert_eq!(empty.average, 0.0);
    }
}
