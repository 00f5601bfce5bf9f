use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_cohortd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn cohortd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Fixture {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn create_batch(&mut self, code: &str, status: &str) -> String {
        let created = self.call("batches.create", json!({ "code": code }));
        let batch_id = created
            .get("id")
            .and_then(|v| v.as_str())
            .expect("batch id")
            .to_string();
        if status != "upcoming" {
            self.call(
                "batches.updateStatus",
                json!({ "batchId": batch_id, "status": status }),
            );
        }
        batch_id
    }

    fn add_student(&mut self, batch_id: &str, first: &str, last: &str) -> String {
        let created = self.call(
            "students.create",
            json!({ "batchId": batch_id, "firstName": first, "lastName": last }),
        );
        created
            .get("id")
            .and_then(|v| v.as_str())
            .expect("student id")
            .to_string()
    }

    fn set_scores(&mut self, student_id: &str, scores: serde_json::Value) {
        self.call(
            "students.update",
            json!({ "studentId": student_id, "scores": scores }),
        );
    }

    fn rankings(&mut self, filters: serde_json::Value) -> Vec<serde_json::Value> {
        self.call("rankings.filtered", json!({ "filters": filters }))
            .get("rankings")
            .and_then(|v| v.as_array())
            .expect("rankings array")
            .clone()
    }
}

fn fixture(prefix: &str) -> (std::process::Child, Fixture) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    (
        child,
        Fixture {
            stdin,
            reader,
            next_id: 0,
        },
    )
}

fn names(rows: &[serde_json::Value]) -> Vec<String> {
    rows.iter()
        .map(|r| {
            r.get("firstName")
                .and_then(|v| v.as_str())
                .expect("firstName")
                .to_string()
        })
        .collect()
}

#[test]
fn filters_respect_batch_status_and_activity_rules() {
    let (_child, mut fx) = fixture("cohort-rankings");

    let active_batch = fx.create_batch("2025-Jan", "active");
    let completed_batch = fx.create_batch("2025-Feb", "active");
    let upcoming_batch = fx.create_batch("2025-Mar", "upcoming");

    let ace = fx.add_student(&active_batch, "Ace", "Silva");
    let mid = fx.add_student(&active_batch, "Mid", "Fonseka");
    let benched = fx.add_student(&active_batch, "Benched", "Jayasuriya");
    let graduate = fx.add_student(&completed_batch, "Graduate", "Herath");
    let _waiting = fx.add_student(&upcoming_batch, "Waiting", "Dias");

    fx.set_scores(
        &ace,
        json!({
            "creativity": 10, "leadership": 10, "behavior": 10, "presentation": 10,
            "communication": 10, "technicalSkills": 10, "generalPerformance": 10
        }),
    );
    fx.set_scores(
        &mid,
        json!({
            "creativity": 8, "leadership": 6, "behavior": 10, "presentation": 4,
            "communication": 8, "technicalSkills": 9, "generalPerformance": 7
        }),
    );
    fx.set_scores(&graduate, json!({ "technicalSkills": 5 }));
    fx.call(
        "students.setActive",
        json!({ "studentId": benched, "isActive": false }),
    );
    fx.call(
        "batches.complete",
        json!({ "batchId": completed_batch }),
    );

    // "all": active students of active batches, plus everyone in completed
    // batches; upcoming batches never rank at all.
    let all = fx.rankings(json!({}));
    assert_eq!(names(&all), vec!["Ace", "Mid", "Graduate"]);
    let ranks: Vec<u64> = all
        .iter()
        .map(|r| r.get("rank").and_then(|v| v.as_u64()).expect("rank"))
        .collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert_eq!(
        all[0].get("overallScore").and_then(|v| v.as_f64()),
        Some(10.0)
    );
    assert_eq!(
        all[1].get("overallScore").and_then(|v| v.as_f64()),
        Some(7.4)
    );
    assert_eq!(
        all[2].get("overallScore").and_then(|v| v.as_f64()),
        Some(1.0)
    );

    let active_only = fx.rankings(json!({ "batchStatus": "active" }));
    assert_eq!(names(&active_only), vec!["Ace", "Mid"]);

    // The completed filter ignores is_active: completion zeroed those flags.
    let completed_only = fx.rankings(json!({ "batchStatus": "completed" }));
    assert_eq!(names(&completed_only), vec!["Graduate"]);

    let searched = fx.rankings(json!({ "search": "fonseka" }));
    assert_eq!(names(&searched), vec!["Mid"]);

    let scoped = fx.rankings(json!({ "batch": active_batch }));
    assert_eq!(names(&scoped), vec!["Ace", "Mid"]);

    // Same data, same call, same answer.
    let again = fx.rankings(json!({}));
    assert_eq!(all, again);
}

#[test]
fn equal_scores_break_ties_by_student_number() {
    let (_child, mut fx) = fixture("cohort-ties");
    let batch_id = fx.create_batch("2025-Jul", "active");

    // Created in this order, so student numbers ascend: 0001, 0002, 0003.
    let first = fx.add_student(&batch_id, "First", "Twin");
    let second = fx.add_student(&batch_id, "Second", "Twin");
    let third = fx.add_student(&batch_id, "Third", "Solo");

    for id in [&first, &second] {
        fx.set_scores(id, json!({ "technicalSkills": 5 }));
    }
    fx.set_scores(&third, json!({ "technicalSkills": 10 }));

    let rows = fx.rankings(json!({}));
    assert_eq!(names(&rows), vec!["Third", "First", "Second"]);
    let ranks: Vec<u64> = rows
        .iter()
        .map(|r| r.get("rank").and_then(|v| v.as_u64()).expect("rank"))
        .collect();
    assert_eq!(ranks, vec![1, 2, 3]);
}

#[test]
fn attendance_percentage_counts_late_as_attended() {
    let (_child, mut fx) = fixture("cohort-attendance-pct");
    let batch_id = fx.create_batch("2025-Aug", "active");
    let student = fx.add_student(&batch_id, "Hasini", "Kumari");

    // Sun/Tue/Thu in early January 2025.
    for (date, status) in [
        ("2025-01-05", "present"),
        ("2025-01-07", "late"),
        ("2025-01-09", "absent"),
    ] {
        fx.call(
            "attendance.record",
            json!({
                "studentId": student,
                "batchId": batch_id,
                "date": date,
                "status": status
            }),
        );
    }

    let rows = fx.rankings(json!({}));
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("attendancePercentage").and_then(|v| v.as_i64()),
        Some(67)
    );

    let stats = fx.call("rankings.stats", json!({ "filters": {} }));
    assert_eq!(stats.get("rankedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        stats
            .get("topPerformer")
            .and_then(|t| t.get("firstName"))
            .and_then(|v| v.as_str()),
        Some("Hasini")
    );
    assert_eq!(stats.get("activeBatches").and_then(|v| v.as_i64()), Some(1));
}
