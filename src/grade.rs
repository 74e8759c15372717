use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_KKM: f64 = 70.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeError {
    #[error("invalid input for {field}: {reason}")]
    InvalidInput { field: String, reason: String },
}

impl GradeError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::InvalidInput { field, .. } => field,
        }
    }
}

/// Institution-wide weighting used by every final-grade computation.
///
/// The five academic weights are percentages and are expected to total 100;
/// the two bonus maxima are points added on top of the 100-point scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightConfiguration {
    pub assignment_weight: f64,
    pub test_weight: f64,
    pub midterm_weight: f64,
    pub final_weight: f64,
    pub attendance_weight: f64,
    pub extracurricular_bonus_max: f64,
    pub student_council_bonus_max: f64,
    pub effective_days_odd_semester: u32,
    pub effective_days_even_semester: u32,
}

impl Default for WeightConfiguration {
    fn default() -> Self {
        Self {
            assignment_weight: 20.0,
            test_weight: 20.0,
            midterm_weight: 20.0,
            final_weight: 25.0,
            attendance_weight: 15.0,
            extracurricular_bonus_max: 5.0,
            student_council_bonus_max: 5.0,
            effective_days_odd_semester: 90,
            effective_days_even_semester: 90,
        }
    }
}

impl WeightConfiguration {
    pub fn academic_total(&self) -> f64 {
        self.assignment_weight
            + self.test_weight
            + self.midterm_weight
            + self.final_weight
            + self.attendance_weight
    }

    pub fn effective_days(&self, semester: Semester) -> u32 {
        match semester {
            Semester::Odd => self.effective_days_odd_semester,
            Semester::Even => self.effective_days_even_semester,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semester {
    Odd,
    Even,
}

impl Semester {
    /// Accepts the stored form plus the Indonesian labels and 1/2 used by spreadsheets.
    pub fn parse(raw: &Value) -> Option<Self> {
        if let Some(n) = raw.as_i64() {
            return match n {
                1 => Some(Self::Odd),
                2 => Some(Self::Even),
                _ => None,
            };
        }
        let s = raw.as_str()?.trim().to_ascii_lowercase();
        match s.as_str() {
            "odd" | "ganjil" | "1" => Some(Self::Odd),
            "even" | "genap" | "2" => Some(Self::Even),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Odd => "odd",
            Self::Even => "even",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GradeRecord {
    pub assignment_scores: Vec<f64>,
    pub test_score: f64,
    pub midterm_score: f64,
    pub final_score: f64,
    pub attendance_percent: f64,
    pub extracurricular_score: f64,
    pub student_council_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailingComponent {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionStatus {
    pub complete: bool,
    pub failing_components: Vec<FailingComponent>,
}

impl CompletionStatus {
    pub fn label(&self) -> &'static str {
        if self.complete {
            "Tuntas"
        } else {
            "Belum Tuntas"
        }
    }
}

/// `round(x * 100) / 100`, half away from zero.
pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Arithmetic mean; NaN entries count toward the length but add nothing.
pub fn compute_average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values
        .iter()
        .map(|v| if v.is_nan() { 0.0 } else { *v })
        .sum();
    sum / values.len() as f64
}

fn ensure_finite(field: &str, v: f64) -> Result<f64, GradeError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(GradeError::invalid(field, "value is not a finite number"))
    }
}

pub fn compute_final_grade(
    record: &GradeRecord,
    weights: &WeightConfiguration,
) -> Result<f64, GradeError> {
    for (i, s) in record.assignment_scores.iter().enumerate() {
        ensure_finite(&format!("assignmentScores[{}]", i), *s)?;
    }
    let test = ensure_finite("testScore", record.test_score)?;
    let midterm = ensure_finite("midtermScore", record.midterm_score)?;
    let final_exam = ensure_finite("finalScore", record.final_score)?;
    let attendance = ensure_finite("attendancePercent", record.attendance_percent)?;
    let extracurricular = ensure_finite("extracurricularScore", record.extracurricular_score)?;
    let council = ensure_finite("studentCouncilScore", record.student_council_score)?;

    let avg_assignments = compute_average(&record.assignment_scores);
    let academic = avg_assignments * (weights.assignment_weight / 100.0)
        + test * (weights.test_weight / 100.0)
        + midterm * (weights.midterm_weight / 100.0)
        + final_exam * (weights.final_weight / 100.0)
        + attendance * (weights.attendance_weight / 100.0);
    let extracurricular_bonus = (extracurricular / 100.0) * weights.extracurricular_bonus_max;
    let council_bonus = (council / 100.0) * weights.student_council_bonus_max;

    let raw = academic + extracurricular_bonus + council_bonus;
    Ok(round_off_2_decimals(raw.min(100.0)))
}

/// Converts a raw attended-day count into a percentage of the effective days.
pub fn attendance_percent(days: f64, effective_days: u32) -> f64 {
    if effective_days == 0 {
        return 0.0;
    }
    round_off_2_decimals((days / effective_days as f64 * 100.0).min(100.0))
}

/// Pass/fail against the KKM. Attendance and bonus scores never gate completion.
pub fn is_complete(record: &GradeRecord, final_grade: f64, kkm: f64) -> CompletionStatus {
    let mut components: Vec<(String, f64)> = record
        .assignment_scores
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("assignment{}", i + 1), *v))
        .collect();
    components.push(("test".to_string(), record.test_score));
    components.push(("midterm".to_string(), record.midterm_score));
    components.push(("final".to_string(), record.final_score));
    components.push(("finalGrade".to_string(), final_grade));

    // NaN never satisfies >=, so corrupted values fail the gate.
    let failing_components: Vec<FailingComponent> = components
        .into_iter()
        .filter(|(_, v)| !(*v >= kkm))
        .map(|(name, value)| FailingComponent { name, value })
        .collect();

    CompletionStatus {
        complete: failing_components.is_empty(),
        failing_components,
    }
}

/// Coerces one loosely typed cell. Missing and null are 0; numeric strings are
/// parsed (spreadsheet exports may use a decimal comma); anything else is rejected.
pub fn coerce_number(raw: Option<&Value>, field: &str) -> Result<f64, GradeError> {
    let Some(v) = raw else { return Ok(0.0) };
    match v {
        Value::Null => Ok(0.0),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| GradeError::invalid(field, "number out of range")),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return Ok(0.0);
            }
            let parsed = t
                .replace(',', ".")
                .parse::<f64>()
                .map_err(|_| GradeError::invalid(field, format!("'{}' is not numeric", t)))?;
            ensure_finite(field, parsed)
        }
        _ => Err(GradeError::invalid(field, "expected a number")),
    }
}

/// A score cell: coerced, then held to the 0..=100 scale.
fn coerce_score(raw: Option<&Value>, field: &str) -> Result<f64, GradeError> {
    let v = coerce_number(raw, field)?;
    if !(0.0..=100.0).contains(&v) {
        return Err(GradeError::invalid(field, "must be within 0..=100"));
    }
    Ok(v)
}

fn coerce_scores(raw: Option<&Value>, field: &str) -> Result<Vec<f64>, GradeError> {
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| coerce_score(Some(v), &format!("{}[{}]", field, i)))
            .collect(),
        Some(single @ (Value::Number(_) | Value::String(_))) => {
            Ok(vec![coerce_score(Some(single), field)?])
        }
        Some(_) => Err(GradeError::invalid(field, "expected an array of numbers")),
    }
}

/// Builds a strict `GradeRecord` from a loosely typed JSON object.
///
/// Scores must lie in 0..=100. `attendancePercent` wins when present; otherwise a
/// non-negative `attendanceDays` is converted with `effective_days` as the denominator.
pub fn parse_grade_record(raw: &Value, effective_days: u32) -> Result<GradeRecord, GradeError> {
    let Some(obj) = raw.as_object() else {
        return Err(GradeError::invalid("record", "expected an object"));
    };

    let attendance_percent = match obj.get("attendancePercent") {
        Some(v) if !v.is_null() => coerce_score(Some(v), "attendancePercent")?,
        _ => match obj.get("attendanceDays") {
            Some(v) if !v.is_null() => {
                let days = coerce_number(Some(v), "attendanceDays")?;
                if days < 0.0 {
                    return Err(GradeError::invalid("attendanceDays", "must not be negative"));
                }
                attendance_percent(days, effective_days)
            }
            _ => 0.0,
        },
    };

    Ok(GradeRecord {
        assignment_scores: coerce_scores(obj.get("assignmentScores"), "assignmentScores")?,
        test_score: coerce_score(obj.get("testScore"), "testScore")?,
        midterm_score: coerce_score(obj.get("midtermScore"), "midtermScore")?,
        final_score: coerce_score(obj.get("finalScore"), "finalScore")?,
        attendance_percent,
        extracurricular_score: coerce_score(obj.get("extracurricularScore"), "extracurricularScore")?,
        student_council_score: coerce_score(obj.get("studentCouncilScore"), "studentCouncilScore")?,
    })
}
