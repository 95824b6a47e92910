use std::path::Path;

use anyhow::Result;

use super::{Build, LanguageOps, args, identity, run_compiler};

pub(super) static OPS: LanguageOps = LanguageOps {
    name: "c",
    version: "gcc C99",
    compile,
    run_command,
    filter_output: identity,
    filter_stderr: identity,
    readable_dirs: &[],
};

/// Warnings are errors so sloppy code fails the same way for every student
fn compile(workdir: &Path, source_file: &str) -> Result<Build> {
    let executable = format!("{source_file}.exe");
    let command = args(&[
        "gcc", "-Wall", "-Werror", "-std=c99", "-x", "c", "-o", &executable, source_file, "-lm",
    ]);
    Ok(run_compiler(&command, workdir)?.map(|_| executable))
}

fn run_command(program: &str) -> Vec<String> {
    vec![format!("./{program}")]
}
