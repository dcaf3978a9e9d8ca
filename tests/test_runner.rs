use std::time::Duration;

use mutduel::error::InfraError;
use mutduel::runner::{self, CommandTemplate, ProcessOutcome};
use tempfile::TempDir;

#[test]
fn parse_command_splits_on_whitespace() {
    let (program, args) = runner::parse_command("  javac   -d out  Foo.java ");
    assert_eq!(program, "javac");
    assert_eq!(args, vec!["-d", "out", "Foo.java"]);

    let (program, args) = runner::parse_command("");
    assert!(program.is_empty());
    assert!(args.is_empty());
}

#[test]
fn template_substitutes_placeholders() {
    let template = CommandTemplate::parse("javac -d {out} -cp {classpath} {source}").unwrap();
    assert_eq!(template.program(), "javac");
    let (program, args) = template.render(&[
        ("out", "/tmp/my build"),
        ("classpath", "a.jar:b.jar"),
        ("source", "/tmp/src/Counter.java"),
    ]);
    assert_eq!(program, "javac");
    assert_eq!(
        args,
        vec!["-d", "/tmp/my build", "-cp", "a.jar:b.jar", "/tmp/src/Counter.java"]
    );
}

#[test]
fn empty_expansions_are_dropped() {
    let template = CommandTemplate::parse("run {extra} {test_class}").unwrap();
    let (_, args) = template.render(&[("extra", ""), ("test_class", "TestCounter")]);
    assert_eq!(args, vec!["TestCounter"]);
}

#[test]
fn blank_template_is_rejected() {
    assert!(matches!(CommandTemplate::parse(" \t"), Err(InfraError::EmptyCommand)));
}

#[cfg(unix)]
#[test]
fn classpath_uses_colon_separator() {
    assert_eq!(runner::join_classpath(["a", "b/c.jar"]).unwrap(), "a:b/c.jar");
    assert!(matches!(
        runner::join_classpath(["a:b"]),
        Err(InfraError::Classpath { .. })
    ));
}

#[cfg(unix)]
#[test]
fn exit_status_and_output_are_captured() {
    let tmp = TempDir::new().unwrap();
    let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()];
    match runner::run_with_timeout("sh", &args, tmp.path(), &[], Duration::from_secs(10)).unwrap() {
        ProcessOutcome::Exited {
            success,
            code,
            stdout,
            stderr,
            ..
        } => {
            assert!(!success);
            assert_eq!(code, Some(3));
            assert_eq!(stdout, "out\n");
            assert_eq!(stderr, "err\n");
        }
        ProcessOutcome::TimedOut { .. } => panic!("unexpected timeout"),
    }
}

#[cfg(unix)]
#[test]
fn environment_and_working_dir_are_applied() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("marker");
    let args = vec!["-c".to_string(), "pwd; echo \"$MARKER\"".to_string()];
    let outcome = runner::run_with_timeout(
        "sh",
        &args,
        tmp.path(),
        &[("MARKER", marker.as_path())],
        Duration::from_secs(10),
    )
    .unwrap();
    let output = outcome.combined_output();
    assert!(output.contains(&marker.display().to_string()));
}

#[cfg(unix)]
#[test]
fn slow_process_is_killed() {
    let tmp = TempDir::new().unwrap();
    let outcome = runner::run_with_timeout(
        "sleep",
        &["5".to_string()],
        tmp.path(),
        &[],
        Duration::from_millis(100),
    )
    .unwrap();
    assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
    assert!(outcome.duration_ms() < 5000);
    assert!(outcome.combined_output().is_empty());
}

#[test]
fn missing_program_fails_to_spawn() {
    let tmp = TempDir::new().unwrap();
    let err = runner::run_with_timeout("mutduel-no-such-program", &[], tmp.path(), &[], Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, InfraError::Spawn { .. }));
}

#[cfg(unix)]
#[test]
fn background_child_holding_output_cannot_outlive_the_timeout() {
    let tmp = TempDir::new().unwrap();
    let args = vec!["-c".to_string(), "sleep 4 &\nexit 1".to_string()];
    let started = std::time::Instant::now();
    let outcome =
        runner::run_with_timeout("sh", &args, tmp.path(), &[], Duration::from_millis(300)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
}

#[cfg(unix)]
#[test]
fn timeout_kills_grandchildren() {
    let tmp = TempDir::new().unwrap();
    let heartbeat = tmp.path().join("alive");
    let script = format!(
        "(while true; do touch {0}; sleep 0.1; done) >/dev/null 2>&1 &\nsleep 30",
        heartbeat.display()
    );
    let args = vec!["-c".to_string(), script];
    let outcome =
        runner::run_with_timeout("sh", &args, tmp.path(), &[], Duration::from_millis(300)).unwrap();
    assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));

    std::thread::sleep(Duration::from_millis(200));
    let _ = std::fs::remove_file(&heartbeat);
    std::thread::sleep(Duration::from_millis(500));
    assert!(!heartbeat.exists(), "background loop survived the timeout");
}

#[cfg(unix)]
#[test]
fn quiet_background_child_does_not_delay_exit() {
    let tmp = TempDir::new().unwrap();
    let args = vec!["-c".to_string(), "sleep 4 >/dev/null 2>&1 &\necho done".to_string()];
    let outcome = runner::run_with_timeout("sh", &args, tmp.path(), &[], Duration::from_secs(3)).unwrap();
    match outcome {
        ProcessOutcome::Exited { success, stdout, .. } => {
            assert!(success);
            assert_eq!(stdout, "done\n");
        }
        ProcessOutcome::TimedOut { .. } => panic!("the child exited right away"),
    }
}
