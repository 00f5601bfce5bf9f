use rusqlite::{params_from_iter, types::Value, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// 1-decimal rounding used for overall scores:
/// `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricScores {
    pub creativity: f64,
    pub leadership: f64,
    pub behavior: f64,
    pub presentation: f64,
    pub communication: f64,
    pub technical_skills: f64,
    pub general_performance: f64,
}

/// Fixed-weight linear combination of the seven performance metrics.
/// Weights sum to 1.0 and are not configurable per call.
pub fn overall_score(m: &MetricScores) -> f64 {
    let raw = 0.15 * m.creativity
        + 0.15 * m.leadership
        + 0.10 * m.behavior
        + 0.15 * m.presentation
        + 0.15 * m.communication
        + 0.20 * m.technical_skills
        + 0.10 * m.general_performance;
    round_off_1_decimal(raw)
}

/// Share of present-or-late records, as a whole percentage. No records is 0.
pub fn attendance_percentage(present_or_late: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    (100.0 * (present_or_late as f64) / (total as f64)).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStatusFilter {
    #[default]
    All,
    Active,
    Completed,
}

impl BatchStatusFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Post-fetch activity rule. Completed batches keep every student because
/// completion force-deactivates them; the flag carries no signal there.
pub fn keeps_student(filter: BatchStatusFilter, batch_status: &str, is_active: bool) -> bool {
    match filter {
        BatchStatusFilter::Active => batch_status == "active" && is_active,
        BatchStatusFilter::Completed => batch_status == "completed",
        BatchStatusFilter::All => {
            (batch_status == "active" && is_active) || batch_status == "completed"
        }
    }
}

pub fn matches_search(query: &str, first_name: &str, last_name: &str, student_no: &str) -> bool {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return true;
    }
    first_name.to_lowercase().contains(&q)
        || last_name.to_lowercase().contains(&q)
        || student_no.to_lowercase().contains(&q)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingFilters {
    pub search: Option<String>,
    pub batch_status: Option<String>,
    pub batch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankingError {
    pub code: String,
    pub message: String,
}

impl RankingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub fn parse_ranking_filters(
    raw: Option<&serde_json::Value>,
) -> Result<(RankingFilters, BatchStatusFilter), RankingError> {
    let filters: RankingFilters = match raw {
        None => RankingFilters::default(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| RankingError::new("bad_params", format!("invalid filters: {}", e)))?,
    };
    let status_filter = match filters.batch_status.as_deref() {
        None => BatchStatusFilter::All,
        Some(s) => BatchStatusFilter::parse(s).ok_or_else(|| {
            RankingError::new(
                "bad_params",
                format!("batchStatus must be all|active|completed, got '{}'", s),
            )
        })?,
    };
    Ok((filters, status_filter))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub id: String,
    pub student_no: String,
    pub first_name: String,
    pub last_name: String,
    pub batch_code: String,
    pub batch_status: String,
    pub scores: MetricScores,
    pub overall_score: f64,
    pub attendance_percentage: i64,
    pub rank: usize,
}

#[derive(Debug, Clone)]
struct EligibleRow {
    id: String,
    student_no: String,
    first_name: String,
    last_name: String,
    batch_code: String,
    batch_status: String,
    is_active: bool,
    scores: MetricScores,
}

/// Sort descending by overall score (ties by ascending student number) and
/// assign 1-based dense ranks.
fn assign_ranks(mut rows: Vec<RankedStudent>) -> Vec<RankedStudent> {
    rows.sort_by(|a, b| {
        b.overall_score
            .partial_cmp(&a.overall_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.student_no.cmp(&b.student_no))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i + 1;
    }
    rows
}

fn load_eligible_rows(
    conn: &Connection,
    filters: &RankingFilters,
    status_filter: BatchStatusFilter,
) -> Result<Vec<EligibleRow>, RankingError> {
    // Upcoming batches never rank; "all" still means active-or-completed.
    let mut sql = String::from(
        "SELECT s.id, s.student_no, s.first_name, s.last_name,
                b.code, b.status, s.is_active,
                s.creativity, s.leadership, s.behavior, s.presentation,
                s.communication, s.technical_skills, s.general_performance
         FROM students s
         JOIN batches b ON b.id = s.batch_id
         WHERE b.status IN ('active', 'completed')",
    );
    let mut params: Vec<Value> = Vec::new();
    match status_filter {
        BatchStatusFilter::All => {}
        BatchStatusFilter::Active => {
            sql.push_str(" AND b.status = 'active'");
        }
        BatchStatusFilter::Completed => {
            sql.push_str(" AND b.status = 'completed'");
        }
    }
    if let Some(batch_id) = filters.batch.as_deref() {
        if batch_id != "all" {
            sql.push_str(" AND b.id = ?");
            params.push(Value::Text(batch_id.to_string()));
        }
    }
    sql.push_str(" ORDER BY s.student_no");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| RankingError::new("db_query_failed", e.to_string()))?;
    stmt.query_map(params_from_iter(params), |r| {
        Ok(EligibleRow {
            id: r.get(0)?,
            student_no: r.get(1)?,
            first_name: r.get(2)?,
            last_name: r.get(3)?,
            batch_code: r.get(4)?,
            batch_status: r.get(5)?,
            is_active: r.get::<_, i64>(6)? != 0,
            scores: MetricScores {
                creativity: r.get(7)?,
                leadership: r.get(8)?,
                behavior: r.get(9)?,
                presentation: r.get(10)?,
                communication: r.get(11)?,
                technical_skills: r.get(12)?,
                general_performance: r.get(13)?,
            },
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| RankingError::new("db_query_failed", e.to_string()))
}

/// One aggregate pass for every surviving student instead of a query per row.
fn load_attendance_percentages(
    conn: &Connection,
    student_ids: &[String],
) -> Result<HashMap<String, i64>, RankingError> {
    let mut out = HashMap::new();
    if student_ids.is_empty() {
        return Ok(out);
    }
    let placeholders = vec!["?"; student_ids.len()].join(", ");
    let sql = format!(
        "SELECT student_id,
                COUNT(*),
                SUM(CASE WHEN status IN ('present', 'late') THEN 1 ELSE 0 END)
         FROM attendance
         WHERE student_id IN ({})
         GROUP BY student_id",
        placeholders
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| RankingError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(
            params_from_iter(student_ids.iter().map(|id| Value::Text(id.clone()))),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| RankingError::new("db_query_failed", e.to_string()))?;
    for (student_id, total, present_or_late) in rows {
        out.insert(student_id, attendance_percentage(present_or_late, total));
    }
    Ok(out)
}

pub fn rankings_filtered(
    conn: &Connection,
    raw_filters: Option<&serde_json::Value>,
) -> Result<Vec<RankedStudent>, RankingError> {
    let (filters, status_filter) = parse_ranking_filters(raw_filters)?;
    let eligible = load_eligible_rows(conn, &filters, status_filter)?;

    let search = filters.search.unwrap_or_default();
    let surviving: Vec<EligibleRow> = eligible
        .into_iter()
        .filter(|row| keeps_student(status_filter, &row.batch_status, row.is_active))
        .filter(|row| matches_search(&search, &row.first_name, &row.last_name, &row.student_no))
        .collect();

    let ids: Vec<String> = surviving.iter().map(|r| r.id.clone()).collect();
    let attendance = load_attendance_percentages(conn, &ids)?;

    let ranked: Vec<RankedStudent> = surviving
        .into_iter()
        .map(|row| {
            let score = overall_score(&row.scores);
            let pct = attendance.get(&row.id).copied().unwrap_or(0);
            RankedStudent {
                id: row.id,
                student_no: row.student_no,
                first_name: row.first_name,
                last_name: row.last_name,
                batch_code: row.batch_code,
                batch_status: row.batch_status,
                scores: row.scores,
                overall_score: score,
                attendance_percentage: pct,
                rank: 0,
            }
        })
        .collect();

    Ok(assign_ranks(ranked))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingStats {
    pub ranked_count: usize,
    pub average_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_performer: Option<RankedStudent>,
    pub active_batches: i64,
    pub completed_batches: i64,
}

pub fn rankings_stats(
    conn: &Connection,
    raw_filters: Option<&serde_json::Value>,
) -> Result<RankingStats, RankingError> {
    let ranked = rankings_filtered(conn, raw_filters)?;

    let average_score = if ranked.is_empty() {
        0.0
    } else {
        let sum: f64 = ranked.iter().map(|r| r.overall_score).sum();
        round_off_1_decimal(sum / ranked.len() as f64)
    };
    let top_performer = ranked.first().cloned();

    let count_for = |status: &str| -> Result<i64, RankingError> {
        conn.query_row(
            "SELECT COUNT(*) FROM batches WHERE status = ?",
            [status],
            |r| r.get(0),
        )
        .map_err(|e| RankingError::new("db_query_failed", e.to_string()))
    };

    Ok(RankingStats {
        ranked_count: ranked.len(),
        average_score,
        top_performer,
        active_batches: count_for("active")?,
        completed_batches: count_for("completed")?,
    })
}
