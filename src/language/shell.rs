use std::path::Path;

use anyhow::Result;

use super::{Build, LanguageOps, args, identity, run_compiler};

pub(super) static OPS: LanguageOps = LanguageOps {
    name: "sh",
    version: "POSIX sh",
    compile,
    run_command,
    filter_output: identity,
    filter_stderr: identity,
    readable_dirs: &["/bin", "/usr/bin", "/lib/", "/lib64/", "/usr/lib", "/etc/"],
};

/// Syntax check only
fn compile(workdir: &Path, source_file: &str) -> Result<Build> {
    let command = args(&["/bin/sh", "-n", source_file]);
    Ok(run_compiler(&command, workdir)?.map(|_| source_file.to_string()))
}

fn run_command(program: &str) -> Vec<String> {
    args(&["/bin/sh", program])
}
