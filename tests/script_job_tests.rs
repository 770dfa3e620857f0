//! Integration tests for Rhai script jobs run through the job queue

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use installer_core::{GlobalStore, JobQueue, QueueEvent, QueueOutcome, RunLocation, ScriptJob};

fn script_file(dir: &Path, source: &str) -> PathBuf {
    let path = dir.join("job.rhai");
    fs::write(&path, source).unwrap();
    path
}

fn run_job(job: ScriptJob, storage: &Arc<GlobalStore>) -> (QueueOutcome, Vec<QueueEvent>) {
    let mut queue = JobQueue::new(Arc::clone(storage));
    queue.enqueue(vec![Box::new(job)]);
    let handle = queue.start().unwrap();
    let events = handle.events().iter().collect();
    (handle.wait(), events)
}

#[test]
fn test_script_reports_progress_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let path = script_file(
        dir.path(),
        r#"
            fn pretty_status_message() { "Writing locale" }

            fn run() {
                installer::job.setprogress(0.25);
                let locale = #{ lang: "de_DE.UTF-8", lc: ["de", "en"] };
                installer::globalstorage.insert("locale", locale);
                installer::job.setprogress(0.75);
            }
        "#,
    );
    let storage = Arc::new(GlobalStore::new());
    let (outcome, events) = run_job(
        ScriptJob::new(path, "locale").with_target_location(RunLocation::Host),
        &storage,
    );

    assert!(outcome.is_success());
    assert_eq!(
        storage.lookup("locale.lang").as_ref().and_then(|v| v.as_str()),
        Some("de_DE.UTF-8")
    );
    assert!(events.iter().any(|e| matches!(
        e,
        QueueEvent::Progress { percent, status }
            if (*percent - 0.75).abs() < 1e-9 && status == "Writing locale"
    )));
}

#[test]
fn test_script_catches_command_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = script_file(
        dir.path(),
        r#"
            let seen = [];
            try {
                check_host_env_call(["sh", "-c", "echo partial; exit 2"]);
            } catch (err) {
                seen.push(err.exit_code);
                seen.push(err.output);
            }
            globalstorage.insert("seen", seen);
            globalstorage.insert("code", host_env_call(["sh", "-c", "exit 5"]));
        "#,
    );
    let storage = Arc::new(GlobalStore::new());
    let (outcome, _) = run_job(ScriptJob::new(path, "m"), &storage);

    assert!(outcome.is_success());
    assert_eq!(storage.lookup("code").and_then(|v| v.as_i64()), Some(5));
    let seen = storage.value("seen");
    let seen = seen.as_sequence().unwrap();
    assert_eq!(seen[0].as_i64(), Some(2));
    assert_eq!(seen[1].as_str(), Some("partial"));
}

#[test]
fn test_uncaught_command_error_fails_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = script_file(
        dir.path(),
        r#"check_host_env_output(["sh", "-c", "echo denied >&2; exit 13"]);"#,
    );
    let storage = Arc::new(GlobalStore::new());
    let (outcome, _) = run_job(ScriptJob::new(path, "m").with_pretty_name("Hook"), &storage);

    match outcome {
        QueueOutcome::Failed { job, message, details, .. } => {
            assert_eq!(job, "Hook");
            assert!(message.contains("exit code 13"), "{}", message);
            assert_eq!(details, "denied");
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[test]
fn test_script_helpers() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("extra.yaml"), "mirrors:\n  - a\n  - b\n").unwrap();
    let path = script_file(
        dir.path(),
        &format!(
            r#"
                let conf = load_yaml("{}/extra.yaml");
                globalstorage.insert("mirrors", conf.mirrors.len());
                globalstorage.insert("missing", load_yaml("{}/absent.yaml").len());
                globalstorage.insert("roundtrip", obscure(obscure("s3cret")));
                let lines = host_env_process_output(["printf", "x\ny\n"]);
                globalstorage.insert("lines", lines);
                print("helpers done");
                warning("just a warning");
            "#,
            dir.path().display(),
            dir.path().display()
        ),
    );
    let storage = Arc::new(GlobalStore::new());
    let (outcome, _) = run_job(ScriptJob::new(path, "m"), &storage);

    assert!(outcome.is_success());
    assert_eq!(storage.value("mirrors").as_i64(), Some(2));
    assert_eq!(storage.value("missing").as_i64(), Some(0));
    assert_eq!(storage.value("roundtrip").as_str(), Some("s3cret"));
    assert_eq!(storage.value("lines").as_sequence().map(<[_]>::len), Some(2));
}
