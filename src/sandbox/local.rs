use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Local;
use directories::ProjectDirs;

use super::{
    DetailFlags, ResourceLimits, ResultCode, RunOutcome, RunRequest, RunSpec, Runner, Sandbox,
    SandboxError, SubmissionDetails, SubmissionHandle, SubmissionStatus,
};
use crate::language::{LanguageKind, LanguageTask};

/// Root under which local backends create their per-task working directories
pub fn default_work_root() -> PathBuf {
    match ProjectDirs::from("", "", "coderunner") {
        Some(dirs) => dirs.cache_dir().join("work"),
        None => std::env::temp_dir().join("coderunner"),
    }
}

/// The run currently tracked by a [`LocalSandbox`]
#[derive(Debug)]
struct CurrentRun {
    handle: SubmissionHandle,
    language: LanguageKind,
    input: String,
    date: String,
    outcome: RunOutcome,
}

/// A backend that compiles and runs programs on this machine
///
/// Runs happen synchronously inside [`Sandbox::create_submission`], so a
/// submission is already done when its handle is returned. The compiled
/// program is kept and reused while consecutive submissions carry
/// byte-identical source, which is only sound because one instance serves a
/// single student submission, one test at a time.
pub struct LocalSandbox<R: Runner> {
    runner: R,
    languages: BTreeSet<String>,
    kinds: BTreeMap<String, LanguageKind>,
    work_root: PathBuf,
    limits: ResourceLimits,
    interpreters: BTreeMap<String, String>,
    task: Option<LanguageTask>,
    current: Option<CurrentRun>,
    next_run_id: u64,
    compile_count: usize,
}

impl<R: Runner> LocalSandbox<R> {
    /// A backend offering every language it knows
    pub fn new(runner: R) -> Self {
        let limits = runner.default_limits();
        let mut sandbox = Self {
            runner,
            languages: BTreeSet::new(),
            kinds: BTreeMap::new(),
            work_root: default_work_root(),
            limits,
            interpreters: BTreeMap::new(),
            task: None,
            current: None,
            next_run_id: 1,
            compile_count: 0,
        };
        sandbox.set_languages(LanguageKind::ALL);
        sandbox
    }

    /// Restricts the backend to the given languages
    pub fn with_languages(mut self, kinds: impl IntoIterator<Item = LanguageKind>) -> Self {
        self.set_languages(kinds);
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replaces the program that starts runs of `language`, e.g. a different
    /// python3 binary
    pub fn with_interpreter(mut self, language: LanguageKind, program: impl Into<String>) -> Self {
        self.interpreters.insert(language.id().to_string(), program.into());
        self
    }

    fn set_languages(&mut self, kinds: impl IntoIterator<Item = LanguageKind>) {
        self.kinds = kinds
            .into_iter()
            .map(|kind| (kind.id().to_string(), kind))
            .collect();
        self.languages = self.kinds.keys().cloned().collect();
    }

    /// Number of times source has actually been compiled by this instance
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    fn close_task(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.close() {
                log::warn!("Failed to remove working directory: {e}");
            }
        }
    }

    /// Makes sure a task compiled from this source exists, compiling only on change
    fn ensure_task(&mut self, kind: LanguageKind, spec: &RunSpec) -> Result<(), SandboxError> {
        let source_file = LanguageTask::source_file_name(spec.params.source_file_name.as_deref())?;
        let reusable = self.task.as_ref().is_some_and(|task| {
            task.kind() == kind
                && task.source() == spec.source_code
                && task.source_file() == source_file
        });
        if !reusable {
            self.close_task();
            self.compile_count += 1;
            let task = LanguageTask::prepare(
                kind,
                &spec.source_code,
                &self.work_root,
                Some(&source_file),
            )?;
            self.task = Some(task);
        }
        Ok(())
    }

    fn run_task(&mut self, kind: LanguageKind, spec: &RunSpec) -> Result<RunOutcome, SandboxError> {
        self.ensure_task(kind, spec)?;
        let task = self
            .task
            .as_ref()
            .ok_or_else(|| SandboxError::Internal("no compiled task".to_string()))?;

        let Some(mut command) = task.run_command() else {
            return Ok(RunOutcome::new(ResultCode::CompilationError));
        };
        if let Some(program) = self.interpreters.get(kind.id()) {
            command[0] = program.clone();
        }
        task.write_files(&spec.files)?;

        let stdin = spec.normalized_stdin();
        let request = RunRequest {
            workdir: task.workdir(),
            command: &command,
            stdin: &stdin,
            limits: self.limits.with_params(&spec.params),
            readable_dirs: task.readable_dirs(),
        };
        let mut outcome = self.runner.run(&request)?;
        outcome.stdout = task.filter_output(&outcome.stdout);
        outcome.stderr = task.filter_stderr(&outcome.stderr);
        Ok(outcome)
    }

    fn current(&self, handle: &SubmissionHandle) -> Result<&CurrentRun, SandboxError> {
        self.current
            .as_ref()
            .filter(|run| &run.handle == handle)
            .ok_or(SandboxError::SubmissionNotFound)
    }
}

impl<R: Runner> Sandbox for LocalSandbox<R> {
    fn name(&self) -> &str {
        self.runner.name()
    }

    fn languages(&self) -> Result<&BTreeSet<String>, SandboxError> {
        Ok(&self.languages)
    }

    fn create_submission(&mut self, spec: &RunSpec) -> Result<SubmissionHandle, SandboxError> {
        let language = spec.language_id();
        let kind = *self
            .kinds
            .get(&language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.clone()))?;

        self.current = None;
        let outcome = self.run_task(kind, spec)?;

        let handle = SubmissionHandle::new(self.next_run_id.to_string());
        self.next_run_id += 1;
        log::debug!(
            "{} sandbox run {handle} ({language}) finished: {:?}",
            self.runner.name(),
            outcome.result
        );

        self.current = Some(CurrentRun {
            handle: handle.clone(),
            language: kind,
            input: spec.normalized_stdin(),
            date: Local::now().format("%Y-%m-%d %H-%M-%S").to_string(),
            outcome,
        });
        Ok(handle)
    }

    fn submission_status(
        &mut self,
        handle: &SubmissionHandle,
    ) -> Result<SubmissionStatus, SandboxError> {
        let run = self.current(handle)?;
        Ok(SubmissionStatus::done(run.outcome.result))
    }

    fn submission_details(
        &mut self,
        handle: &SubmissionHandle,
        flags: DetailFlags,
    ) -> Result<SubmissionDetails, SandboxError> {
        let run = self.current(handle)?;
        let task = self.task.as_ref();
        let compile_info = task.map(|task| task.compile_info().to_string()).unwrap_or_default();

        Ok(SubmissionDetails {
            result: Some(run.outcome.result),
            language: run.language.id().to_string(),
            language_version: Some(run.language.ops().version.to_string()),
            time: run.outcome.time,
            memory_used: run.outcome.memory,
            signal: run.outcome.signal,
            date: run.date.clone(),
            source: flags
                .with_source
                .then(|| task.map(|task| task.source().to_string()))
                .flatten(),
            input: flags.with_input.then(|| run.input.clone()),
            stdout: flags.with_output.then(|| run.outcome.stdout.clone()),
            stderr: flags.with_stderr.then(|| run.outcome.stderr.clone()),
            compile_info: flags.with_compile_info.then_some(compile_info),
        })
    }

    fn close(&mut self) {
        self.current = None;
        self.close_task();
    }
}

impl<R: Runner> Drop for LocalSandbox<R> {
    fn drop(&mut self) {
        self.close();
    }
}
