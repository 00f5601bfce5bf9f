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
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn create_batch(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    code: &str,
) -> String {
    let created = request_ok(stdin, reader, id, "batches.create", json!({ "code": code }));
    created
        .get("id")
        .and_then(|v| v.as_str())
        .expect("batch id")
        .to_string()
}

fn add_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    batch_id: &str,
    first: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "batchId": batch_id, "firstName": first, "lastName": "Perera" }),
    );
    created
        .get("id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string()
}

fn active_flags(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    batch_id: &str,
) -> Vec<bool> {
    let listed = request_ok(
        stdin,
        reader,
        id,
        "students.list",
        json!({ "batchId": batch_id }),
    );
    listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students array")
        .iter()
        .map(|s| s.get("isActive").and_then(|v| v.as_bool()).expect("isActive"))
        .collect()
}

#[test]
fn completing_a_batch_deactivates_every_student_and_pins_module_three() {
    let workspace = temp_dir("cohort-lifecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let batch_id = create_batch(&mut stdin, &mut reader, "2", "2025-Jan");
    for (i, name) in ["Amal", "Bimal", "Chamari"].iter().enumerate() {
        add_student(&mut stdin, &mut reader, &format!("s{}", i), &batch_id, name);
    }

    // Starting the batch does not touch student flags.
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "batches.updateStatus",
        json!({ "batchId": batch_id, "status": "active" }),
    );
    assert_eq!(
        started.get("studentsAffected").and_then(|v| v.as_u64()),
        Some(0)
    );
    assert_eq!(
        active_flags(&mut stdin, &mut reader, "4", &batch_id),
        vec![true, true, true]
    );

    let completed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "batches.complete",
        json!({ "batchId": batch_id }),
    );
    assert_eq!(
        completed.get("studentsAffected").and_then(|v| v.as_u64()),
        Some(3)
    );
    assert_eq!(
        completed.get("currentModule").and_then(|v| v.as_i64()),
        Some(3)
    );
    assert_eq!(
        active_flags(&mut stdin, &mut reader, "6", &batch_id),
        vec![false, false, false]
    );

    // The deactivated students still rank under the completed filter.
    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "rankings.filtered",
        json!({ "filters": { "batchStatus": "completed" } }),
    );
    let rows = ranked
        .get("rankings")
        .and_then(|v| v.as_array())
        .expect("rankings array");
    assert_eq!(rows.len(), 3);
}

#[test]
fn reactivating_a_completed_batch_reactivates_every_student() {
    let workspace = temp_dir("cohort-reactivate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let batch_id = create_batch(&mut stdin, &mut reader, "2", "2025-Feb");
    add_student(&mut stdin, &mut reader, "3", &batch_id, "Dinuka");
    add_student(&mut stdin, &mut reader, "4", &batch_id, "Eshan");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "batches.complete",
        json!({ "batchId": batch_id }),
    );
    assert_eq!(
        active_flags(&mut stdin, &mut reader, "6", &batch_id),
        vec![false, false]
    );

    let reactivated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "batches.updateStatus",
        json!({ "batchId": batch_id, "status": "active" }),
    );
    assert_eq!(
        reactivated.get("studentsAffected").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(
        active_flags(&mut stdin, &mut reader, "8", &batch_id),
        vec![true, true]
    );
}

#[test]
fn cascades_never_leak_into_other_batches() {
    let workspace = temp_dir("cohort-isolation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let completed_batch = create_batch(&mut stdin, &mut reader, "2", "2025-Mar");
    let bystander_batch = create_batch(&mut stdin, &mut reader, "3", "2025-Apr");
    add_student(&mut stdin, &mut reader, "4", &completed_batch, "Farhan");
    add_student(&mut stdin, &mut reader, "5", &bystander_batch, "Gayani");

    // upcoming -> completed directly still only touches its own batch.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "batches.updateStatus",
        json!({ "batchId": completed_batch, "status": "completed" }),
    );
    assert_eq!(
        active_flags(&mut stdin, &mut reader, "7", &completed_batch),
        vec![false]
    );
    assert_eq!(
        active_flags(&mut stdin, &mut reader, "8", &bystander_batch),
        vec![true]
    );

    // A same-status write is a no-op for students everywhere.
    let noop = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "batches.updateStatus",
        json!({ "batchId": completed_batch, "status": "completed" }),
    );
    assert_eq!(noop.get("studentsAffected").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        active_flags(&mut stdin, &mut reader, "10", &bystander_batch),
        vec![true]
    );
}
