use std::path::Path;

use anyhow::Result;

use super::{Build, LanguageOps, args, identity, run_compiler};

const READABLE_DIRS: &[&str] = &[
    "/lib/",
    "/lib64/",
    "/etc/",
    "/usr/local/lib",
    "/usr/lib",
    "/usr/bin",
    "/proc/meminfo",
    "/usr/include",
    "/dev/urandom",
    "/usr/local",
    "/usr/pyvenv.cfg",
];

pub(super) static PYTHON2_OPS: LanguageOps = LanguageOps {
    name: "python2",
    version: "Python 2.7",
    compile: compile_python2,
    run_command: run_python2,
    filter_output: identity,
    filter_stderr: identity,
    readable_dirs: READABLE_DIRS,
};

pub(super) static PYTHON3_OPS: LanguageOps = LanguageOps {
    name: "python3",
    version: "Python 3",
    compile: compile_python3,
    run_command: run_python3,
    filter_output: identity,
    filter_stderr: identity,
    readable_dirs: READABLE_DIRS,
};

fn syntax_check(interpreter: &str, workdir: &Path, source_file: &str) -> Result<Build> {
    let command = args(&[interpreter, "-m", "py_compile", source_file]);
    Ok(run_compiler(&command, workdir)?.map(|_| source_file.to_string()))
}

fn compile_python2(workdir: &Path, source_file: &str) -> Result<Build> {
    syntax_check("python2", workdir, source_file)
}

fn compile_python3(workdir: &Path, source_file: &str) -> Result<Build> {
    syntax_check("python3", workdir, source_file)
}

fn run_python2(program: &str) -> Vec<String> {
    args(&["/usr/bin/python2", "-BESs", program])
}

fn run_python3(program: &str) -> Vec<String> {
    args(&["/usr/bin/python3", "-BE", program])
}
