//! Per-language compile and run behaviour for the local backends

mod c;
mod java;
mod matlab;
mod octave;
mod python;
mod shell;

pub use java::main_class;

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::sandbox::spawn::{SpawnLimits, run_process};

/// Name the submitted source is saved under unless the run overrides it
pub const DEFAULT_SOURCE_FILE: &str = "sourceFile";

const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Languages the local backends know how to build and run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LanguageKind {
    C,
    Java,
    Python2,
    Python3,
    Matlab,
    Octave,
    #[serde(rename = "sh")]
    Shell,
}

/// Result of a compile step: the name the run command needs, or the
/// compiler's diagnostics
pub type Build = std::result::Result<String, String>;

/// Capability table entry for one language
pub struct LanguageOps {
    pub name: &'static str,
    pub version: &'static str,
    /// Compiles `source_file` inside `workdir`
    pub compile: fn(workdir: &Path, source_file: &str) -> Result<Build>,
    pub run_command: fn(program: &str) -> Vec<String>,
    pub filter_output: fn(&str) -> String,
    pub filter_stderr: fn(&str) -> String,
    /// Paths outside the working directory a confined run may read
    pub readable_dirs: &'static [&'static str],
}

impl LanguageKind {
    pub const ALL: [LanguageKind; 7] = [
        Self::C,
        Self::Java,
        Self::Python2,
        Self::Python3,
        Self::Matlab,
        Self::Octave,
        Self::Shell,
    ];

    pub fn ops(self) -> &'static LanguageOps {
        match self {
            Self::C => &c::OPS,
            Self::Java => &java::OPS,
            Self::Python2 => &python::PYTHON2_OPS,
            Self::Python3 => &python::PYTHON3_OPS,
            Self::Matlab => &matlab::OPS,
            Self::Octave => &octave::OPS,
            Self::Shell => &shell::OPS,
        }
    }

    pub fn id(self) -> &'static str {
        self.ops().name
    }
}

impl fmt::Display for LanguageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for LanguageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == s)
            .ok_or_else(|| anyhow!("Unknown language {s}"))
    }
}

pub(crate) fn identity(text: &str) -> String {
    text.to_string()
}

/// Runs a trusted build command, turning failure into compiler diagnostics
pub(crate) fn run_compiler(command: &[String], workdir: &Path) -> Result<Build> {
    log::debug!("Compiling with {command:?}");
    let output = run_process(command, workdir, "", &SpawnLimits::wall_only(COMPILE_TIMEOUT))?;
    if output.timed_out {
        return Ok(Err("Compilation timed out".to_string()));
    }
    if output.success() {
        return Ok(Ok(String::new()));
    }
    let mut info = output.stderr;
    info.push_str(&output.stdout);
    if info.is_empty() {
        info = format!("Compiler exited with {:?}", output.exit_code);
    }
    Ok(Err(info))
}

pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// One compiled program in its private working directory
///
/// The directory is removed when the task is dropped or closed, whether or
/// not compilation succeeded.
#[derive(Debug)]
pub struct LanguageTask {
    kind: LanguageKind,
    source: String,
    source_file: String,
    workdir: TempDir,
    build: Build,
}

impl LanguageTask {
    /// Creates a working directory under `root`, saves the source and compiles it
    pub fn prepare(
        kind: LanguageKind,
        source: &str,
        root: &Path,
        source_file: Option<&str>,
    ) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create work root {}", root.display()))?;
        let workdir = tempfile::Builder::new()
            .prefix("coderunner_")
            .tempdir_in(root)?;

        let source_file = Self::source_file_name(source_file)?;
        fs::write(workdir.path().join(&source_file), source)?;

        let build = (kind.ops().compile)(workdir.path(), &source_file)?;
        if let Err(info) = &build {
            log::debug!("{kind} compile failed: {}", info.trim_end());
        }

        Ok(Self {
            kind,
            source: source.to_string(),
            source_file,
            workdir,
            build,
        })
    }

    /// The name the source is saved under, stripped of any directories
    pub fn source_file_name(requested: Option<&str>) -> Result<String> {
        let name = requested.unwrap_or(DEFAULT_SOURCE_FILE);
        Ok(plain_file_name(name)?.to_string_lossy().into_owned())
    }

    pub fn kind(&self) -> LanguageKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn version(&self) -> &'static str {
        self.kind.ops().version
    }

    /// Compiler diagnostics, empty when the build succeeded
    pub fn compile_info(&self) -> &str {
        match &self.build {
            Ok(_) => "",
            Err(info) => info,
        }
    }

    /// None when compilation failed
    pub fn run_command(&self) -> Option<Vec<String>> {
        let program = self.build.as_ref().ok()?;
        Some((self.kind.ops().run_command)(program))
    }

    pub fn readable_dirs(&self) -> &'static [&'static str] {
        self.kind.ops().readable_dirs
    }

    pub fn filter_output(&self, stdout: &str) -> String {
        (self.kind.ops().filter_output)(stdout)
    }

    pub fn filter_stderr(&self, stderr: &str) -> String {
        (self.kind.ops().filter_stderr)(stderr)
    }

    /// Writes runtime data files into the working directory
    pub fn write_files(&self, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        for (name, contents) in files {
            let path = self.file_path(name)?;
            fs::write(&path, contents)
                .with_context(|| format!("Failed to write data file {}", path.display()))?;
        }
        Ok(())
    }

    fn file_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.workdir.path().join(plain_file_name(name)?))
    }

    pub fn close(self) -> Result<()> {
        self.workdir.close()?;
        Ok(())
    }
}

/// Last component of `name`, so nothing is written outside the working directory
fn plain_file_name(name: &str) -> Result<&OsStr> {
    Path::new(name)
        .file_name()
        .ok_or_else(|| anyhow!("Invalid file name {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_ids_round_trip() {
        for kind in LanguageKind::ALL {
            assert_eq!(kind.id().parse::<LanguageKind>().unwrap(), kind);
        }
        assert_eq!("Python3".parse::<LanguageKind>().unwrap(), LanguageKind::Python3);
        assert!("cobol".parse::<LanguageKind>().is_err());
    }

    #[test]
    fn test_workdir_removed_on_close() {
        let root = tempfile::tempdir().unwrap();
        let task =
            LanguageTask::prepare(LanguageKind::Shell, "echo hi\n", root.path(), None).unwrap();
        let workdir = task.workdir().to_path_buf();
        assert!(workdir.join(DEFAULT_SOURCE_FILE).exists());

        task.close().unwrap();
        assert!(!workdir.exists());
    }

    #[test]
    fn test_source_file_stays_inside_workdir() {
        let root = tempfile::tempdir().unwrap();
        let task =
            LanguageTask::prepare(LanguageKind::Shell, "echo hi\n", root.path(), Some("../escape.sh"))
                .unwrap();
        assert_eq!(task.source_file(), "escape.sh");
        assert!(task.workdir().join("escape.sh").exists());
        assert!(!root.path().join("escape.sh").exists());

        assert!(LanguageTask::prepare(LanguageKind::Shell, "echo hi\n", root.path(), Some("..")).is_err());
    }

    #[test]
    fn test_workdir_removed_after_failed_compile() {
        let root = tempfile::tempdir().unwrap();
        let task =
            LanguageTask::prepare(LanguageKind::Shell, "if then fi (\n", root.path(), None).unwrap();
        assert!(!task.compile_info().is_empty());
        assert_eq!(task.run_command(), None);

        let workdir = task.workdir().to_path_buf();
        drop(task);
        assert!(!workdir.exists());
    }

    #[test]
    fn test_data_files_stay_inside_workdir() {
        let root = tempfile::tempdir().unwrap();
        let task = LanguageTask::prepare(LanguageKind::Shell, "cat data.txt\n", root.path(), None)
            .unwrap();
        let files = BTreeMap::from([("../data.txt".to_string(), b"42\n".to_vec())]);
        task.write_files(&files).unwrap();

        assert!(task.workdir().join("data.txt").exists());
        assert!(!root.path().join("data.txt").exists());
    }
}
