use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::{Build, LanguageOps, args};

const BANNER_END: &str = "For product information, visit www.mathworks.com.";

pub(super) static OPS: LanguageOps = LanguageOps {
    name: "matlab",
    version: "Matlab R2013b",
    compile,
    run_command,
    filter_output,
    filter_stderr,
    readable_dirs: &[],
};

/// Copies the source to an `.m` file; the function name is the source name
pub(super) fn compile(workdir: &Path, source_file: &str) -> Result<Build> {
    let script = format!("{source_file}.m");
    fs::copy(workdir.join(source_file), workdir.join(&script))
        .with_context(|| format!("Couldn't copy {source_file} to {script}"))?;
    Ok(Ok(source_file.to_string()))
}

fn run_command(program: &str) -> Vec<String> {
    args(&["/usr/local/bin/matlab_exec_cli", "-nojvm", "-r", program])
}

/// Drops the startup banner and the blank lines around the real output
fn filter_output(stdout: &str) -> String {
    let mut lines = Vec::new();
    let mut banner_done = false;
    for line in stdout.split('\n') {
        let line = line.trim_end();
        if banner_done {
            lines.push(line);
        }
        if line.contains(BANNER_END) {
            banner_done = true;
        }
    }

    let first = lines.iter().position(|line| !line.is_empty());
    let last = lines.iter().rposition(|line| !line.is_empty());
    match (first, last) {
        (Some(first), Some(last)) => format!("{}\n", lines[first..=last].join("\n")),
        _ => "\n".to_string(),
    }
}

/// Removes bells and applies backspaces
fn filter_stderr(stderr: &str) -> String {
    let mut out = String::with_capacity(stderr.len());
    for c in stderr.chars() {
        match c {
            '\x07' => {}
            '\x08' if !out.is_empty() => {
                out.pop();
            }
            _ => out.push(c),
        }
    }
    out
}
