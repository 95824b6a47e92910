use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use coderunner::language::LanguageKind;
use coderunner::sandbox::{
    GuardedRunner, LocalSandbox, ProcessRunner, ResourceLimits, ResultCode, RunParams, RunSpec,
    Sandbox, SandboxError, VmRunner,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn relaxed() -> ResourceLimits {
    ResourceLimits {
        memory_mb: 0,
        num_procs: 0,
        ..ResourceLimits::default()
    }
}

fn process_sandbox(root: &Path) -> LocalSandbox<ProcessRunner> {
    LocalSandbox::new(ProcessRunner::new())
        .with_languages([LanguageKind::Shell])
        .with_work_root(root)
        .with_limits(relaxed())
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_identical_source_compiled_once() {
    init();
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = process_sandbox(root.path());

    let spec = RunSpec::new("read x; echo \"got $x\"", "sh");
    let first = sandbox.execute(&spec.clone().with_stdin("1")).unwrap();
    let second = sandbox.execute(&spec.with_stdin("2")).unwrap();
    assert_eq!(first.stdout, "got 1\n");
    assert_eq!(second.stdout, "got 2\n");
    assert_eq!(sandbox.compile_count(), 1);

    let third = sandbox.execute(&RunSpec::new("echo other", "sh")).unwrap();
    assert_eq!(third.result, ResultCode::Success);
    assert_eq!(sandbox.compile_count(), 2);
}

#[test]
fn test_renamed_source_is_compiled_again() {
    init();
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = process_sandbox(root.path());

    let named = |name: &str| {
        RunSpec::new("echo \"$0\"", "sh").with_params(RunParams {
            source_file_name: Some(name.to_string()),
            ..RunParams::default()
        })
    };
    assert_eq!(sandbox.execute(&named("first.sh")).unwrap().stdout, "first.sh\n");
    assert_eq!(sandbox.execute(&named("second.sh")).unwrap().stdout, "second.sh\n");
    assert_eq!(sandbox.compile_count(), 2);

    sandbox.execute(&named("second.sh")).unwrap();
    assert_eq!(sandbox.compile_count(), 2);
}

#[test]
fn test_compile_error_reported_as_result() {
    init();
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = process_sandbox(root.path());

    let run = sandbox.execute(&RunSpec::new("if then fi (", "sh")).unwrap();
    assert_eq!(run.result, ResultCode::CompilationError);
    assert!(!run.compile_info.is_empty());
    assert!(run.stdout.is_empty());
}

#[test]
fn test_wall_clock_limit() {
    init();
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = process_sandbox(root.path());

    let params = RunParams {
        wallclock_limit: Some(1),
        ..RunParams::default()
    };
    let run = sandbox
        .execute(&RunSpec::new("sleep 5", "sh").with_params(params))
        .unwrap();
    assert_eq!(run.result, ResultCode::TimeLimitExceeded);
}

#[test]
fn test_runtime_error() {
    init();
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = process_sandbox(root.path());

    let run = sandbox.execute(&RunSpec::new("echo partial; exit 3", "sh")).unwrap();
    assert_eq!(run.result, ResultCode::RuntimeError);
    assert_eq!(run.stdout, "partial\n");
}

#[test]
fn test_data_files_visible_to_program() {
    init();
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = process_sandbox(root.path());

    let spec = RunSpec::new("cat data.txt", "sh").with_file("data.txt", "payload\n");
    assert_eq!(sandbox.execute(&spec).unwrap().stdout, "payload\n");
}

#[test]
fn test_unsupported_language_never_runs() {
    init();
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = process_sandbox(root.path());

    let err = sandbox
        .create_submission(&RunSpec::new("print(1)", "python3"))
        .unwrap_err();
    assert_eq!(err, SandboxError::UnsupportedLanguage("python3".to_string()));
    assert_eq!(sandbox.compile_count(), 0);
    assert_eq!(fs::read_dir(root.path()).map(|d| d.count()).unwrap_or(0), 0);
}

#[test]
fn test_languages_are_stable() {
    let sandbox = LocalSandbox::new(ProcessRunner::new());
    let first = sandbox.languages().unwrap().clone();
    assert_eq!(&first, sandbox.languages().unwrap());
    assert!(first.contains("python3"));
    assert!(first.contains("java"));
    assert!(sandbox.supports("Python3").unwrap());
    assert!(!sandbox.supports("cobol").unwrap());
}

#[test]
fn test_guarded_wrapper_verdict() {
    init();
    let bin = tempfile::tempdir().unwrap();
    let wrapper = script(
        bin.path(),
        "wrapper",
        r#"#!/bin/sh
if [ ! -f "$1" ]; then
    printf '%s\n' '{"returnCode": "IE"}'
    exit 0
fi
printf '%s\n' '{"returnCode": "OK", "output": "from wrapper\n", "stderr": "", "details": {"signal_info": [0], "elapsed": 0.01, "mem_info": [2048]}}'
"#,
    );
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = LocalSandbox::new(GuardedRunner::new(wrapper))
        .with_languages([LanguageKind::Shell])
        .with_work_root(root.path());
    assert_eq!(sandbox.name(), "guarded");

    let run = sandbox.execute(&RunSpec::new("echo ignored", "sh")).unwrap();
    assert_eq!(run.result, ResultCode::Success);
    assert_eq!(run.stdout, "from wrapper\n");
}

#[test]
fn test_vm_bridge_runs_in_workdir() {
    init();
    let bin = tempfile::tempdir().unwrap();
    let bridge = script(
        bin.path(),
        "bridge",
        "#!/bin/sh\ncd \"$1\" || exit 1\nshift\nexec \"$@\"\n",
    );
    let root = tempfile::tempdir().unwrap();
    let mut sandbox = LocalSandbox::new(VmRunner::new(bridge))
        .with_languages([LanguageKind::Shell])
        .with_work_root(root.path());
    assert_eq!(sandbox.name(), "vm");

    let run = sandbox
        .execute(&RunSpec::new("read x; echo \"vm $x\"", "sh").with_stdin("ok"))
        .unwrap();
    assert_eq!(run.result, ResultCode::Success);
    assert_eq!(run.stdout, "vm ok\n");

    let failed = sandbox
        .execute(&RunSpec::new("echo oops >&2", "sh"))
        .unwrap();
    assert_eq!(failed.result, ResultCode::AbnormalTermination);
}
