use crate::error::EngineError;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;

/// Half-up rounding to 2 decimals, matching how the original app reported
/// percentages: `round(x * 100) / 100`.
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Ten-band letter scale. First band whose floor the percentage reaches wins.
const LETTER_BANDS: &[(f64, &str)] = &[
    (97.0, "A+"),
    (93.0, "A"),
    (90.0, "A-"),
    (87.0, "B+"),
    (83.0, "B"),
    (80.0, "B-"),
    (77.0, "C+"),
    (73.0, "C"),
    (70.0, "C-"),
    (67.0, "D+"),
    (63.0, "D"),
    (60.0, "D-"),
];

pub fn letter_for(percentage: f64) -> &'static str {
    for (floor, letter) in LETTER_BANDS {
        if percentage >= *floor {
            return letter;
        }
    }
    "F"
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreParts {
    pub percentage: f64,
    pub letter_grade: String,
}

/// Derive percentage and letter grade from raw points. A zero `max_points`
/// yields 0% rather than dividing by zero.
pub fn derive_score(points: f64, max_points: f64) -> Result<ScoreParts, EngineError> {
    if max_points < 0.0 {
        return Err(EngineError::invalid_input("maxPoints must not be negative"));
    }
    if points < 0.0 {
        return Err(EngineError::invalid_input("points must not be negative"));
    }
    let percentage = if max_points > 0.0 {
        round2(points / max_points * 100.0)
    } else {
        0.0
    };
    Ok(ScoreParts {
        percentage,
        letter_grade: letter_for(percentage).to_string(),
    })
}

/// Strict greater-than against the due date, no grace period. `None` when
/// either side is missing.
pub fn mark_lateness(
    due_date: Option<NaiveDateTime>,
    submitted_at: Option<NaiveDateTime>,
) -> Option<bool> {
    match (due_date, submitted_at) {
        (Some(due), Some(submitted)) => Some(submitted > due),
        _ => None,
    }
}

/// Minimal grade row the summary functions operate on. Handlers fetch these
/// from persistence and hand them over; the engine never queries.
#[derive(Debug, Clone)]
pub struct GradeRow {
    pub student_id: String,
    pub class_id: String,
    pub points: f64,
    pub max_points: f64,
    pub is_excused: bool,
    pub is_extra_credit: bool,
}

impl GradeRow {
    fn counts_toward_totals(&self) -> bool {
        !self.is_excused && !self.is_extra_credit
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStanding {
    pub student_id: String,
    pub total_points: f64,
    pub total_max_points: f64,
    pub percentage: f64,
    pub letter_grade: String,
    pub grade_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub total_students: usize,
    pub total_grades: usize,
    pub class_average: f64,
    pub highest_grade: f64,
    pub lowest_grade: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGradeSummary {
    pub per_student: Vec<StudentStanding>,
    pub statistics: ClassStatistics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStanding {
    pub class_id: String,
    pub total_points: f64,
    pub total_max_points: f64,
    pub percentage: f64,
    pub letter_grade: String,
    pub grade_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeSummary {
    pub per_class: Vec<ClassStanding>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    points: f64,
    max_points: f64,
    count: usize,
}

fn percentage_of(t: &Totals) -> f64 {
    if t.max_points > 0.0 {
        round2(t.points / t.max_points * 100.0)
    } else {
        0.0
    }
}

/// Group one class's grades by student. Excused and extra-credit grades are
/// left out of the point totals; a student with only such grades still
/// appears, at 0%, and is excluded from the class average/min/max (those
/// cover non-zero standings only).
pub fn summarize_for_class(rows: &[GradeRow]) -> ClassGradeSummary {
    let mut by_student: HashMap<String, Totals> = HashMap::new();
    for row in rows {
        let entry = by_student.entry(row.student_id.clone()).or_default();
        if row.counts_toward_totals() {
            entry.points += row.points;
            entry.max_points += row.max_points;
            entry.count += 1;
        }
    }

    let mut per_student: Vec<StudentStanding> = by_student
        .into_iter()
        .map(|(student_id, totals)| {
            let percentage = percentage_of(&totals);
            StudentStanding {
                student_id,
                total_points: totals.points,
                total_max_points: totals.max_points,
                percentage,
                letter_grade: letter_for(percentage).to_string(),
                grade_count: totals.count,
            }
        })
        .collect();
    per_student.sort_by(|a, b| a.student_id.cmp(&b.student_id));

    let scored: Vec<f64> = per_student
        .iter()
        .map(|s| s.percentage)
        .filter(|p| *p > 0.0)
        .collect();
    let class_average = if scored.is_empty() {
        0.0
    } else {
        round2(scored.iter().sum::<f64>() / scored.len() as f64)
    };
    let highest_grade = scored.iter().copied().fold(0.0_f64, f64::max);
    let lowest_grade = if scored.is_empty() {
        0.0
    } else {
        scored.iter().copied().fold(f64::INFINITY, f64::min)
    };

    let statistics = ClassStatistics {
        total_students: per_student.len(),
        total_grades: rows.len(),
        class_average,
        highest_grade,
        lowest_grade,
    };

    ClassGradeSummary {
        per_student,
        statistics,
    }
}

/// Same grouping keyed by class, for one student's transcript view.
pub fn summarize_for_student(rows: &[GradeRow]) -> StudentGradeSummary {
    let mut by_class: HashMap<String, Totals> = HashMap::new();
    for row in rows {
        let entry = by_class.entry(row.class_id.clone()).or_default();
        if row.counts_toward_totals() {
            entry.points += row.points;
            entry.max_points += row.max_points;
            entry.count += 1;
        }
    }

    let mut per_class: Vec<ClassStanding> = by_class
        .into_iter()
        .map(|(class_id, totals)| {
            let percentage = percentage_of(&totals);
            ClassStanding {
                class_id,
                total_points: totals.points,
                total_max_points: totals.max_points,
                percentage,
                letter_grade: letter_for(percentage).to_string(),
                grade_count: totals.count,
            }
        })
        .collect();
    per_class.sort_by(|a, b| a.class_id.cmp(&b.class_id));

    StudentGradeSummary { per_class }
}
