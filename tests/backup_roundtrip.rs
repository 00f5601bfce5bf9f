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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn result_of(value: serde_json::Value, method: &str) -> serde_json::Value {
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn batch_codes(result: &serde_json::Value) -> Vec<String> {
    result
        .get("batches")
        .and_then(|v| v.as_array())
        .expect("batches array")
        .iter()
        .map(|b| {
            b.get("code")
                .and_then(|v| v.as_str())
                .expect("code")
                .to_string()
        })
        .collect()
}

#[test]
fn exported_bundle_restores_a_wiped_workspace() {
    let workspace = temp_dir("cohort-backup-src");
    let bundle = temp_dir("cohort-backup-out").join("cohort-backup.zip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = result_of(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );

    for (i, code) in ["2025-Jan", "2025-Feb"].iter().enumerate() {
        let _ = result_of(
            request(
                &mut stdin,
                &mut reader,
                &format!("b{}", i),
                "batches.create",
                json!({ "code": code, "status": "active" }),
            ),
            "batches.create",
        );
    }

    let exported = result_of(
        request(
            &mut stdin,
            &mut reader,
            "2",
            "backup.export",
            json!({ "outPath": bundle.to_string_lossy() }),
        ),
        "backup.export",
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("cohort-workspace-v1")
    );
    assert_eq!(
        exported
            .get("dbSha256")
            .and_then(|v| v.as_str())
            .map(|s| s.len()),
        Some(64)
    );
    assert!(bundle.exists());

    // Wipe: point the sidecar at a fresh workspace and restore into it.
    let restored_ws = temp_dir("cohort-backup-dst");
    let _ = result_of(
        request(
            &mut stdin,
            &mut reader,
            "3",
            "workspace.select",
            json!({ "path": restored_ws.to_string_lossy() }),
        ),
        "workspace.select",
    );
    let before = result_of(
        request(&mut stdin, &mut reader, "4", "batches.list", json!({})),
        "batches.list",
    );
    assert!(batch_codes(&before).is_empty());

    let imported = result_of(
        request(
            &mut stdin,
            &mut reader,
            "5",
            "backup.import",
            json!({ "inPath": bundle.to_string_lossy() }),
        ),
        "backup.import",
    );
    assert_eq!(
        imported
            .get("bundleFormatDetected")
            .and_then(|v| v.as_str()),
        Some("cohort-workspace-v1")
    );

    let after = result_of(
        request(&mut stdin, &mut reader, "6", "batches.list", json!({})),
        "batches.list",
    );
    let mut codes = batch_codes(&after);
    codes.sort();
    assert_eq!(codes, vec!["2025-Feb", "2025-Jan"]);
}

#[test]
fn corrupt_bundles_are_refused_and_the_workspace_survives() {
    let workspace = temp_dir("cohort-backup-corrupt");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = result_of(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );
    let _ = result_of(
        request(
            &mut stdin,
            &mut reader,
            "2",
            "batches.create",
            json!({ "code": "2025-Mar", "status": "upcoming" }),
        ),
        "batches.create",
    );

    let junk = workspace.join("not-a-bundle.zip");
    std::fs::write(&junk, b"definitely not a zip archive").expect("write junk file");

    let response = request(
        &mut stdin,
        &mut reader,
        "3",
        "backup.import",
        json!({ "inPath": junk.to_string_lossy() }),
    );
    assert_eq!(response.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        response
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("backup_import_failed")
    );

    // The import failed before touching the live database.
    let listed = result_of(
        request(&mut stdin, &mut reader, "4", "batches.list", json!({})),
        "batches.list",
    );
    assert_eq!(batch_codes(&listed), vec!["2025-Mar"]);
}
