use super::{LanguageOps, args, identity};

pub(super) static OPS: LanguageOps = LanguageOps {
    name: "octave",
    version: "Octave",
    compile: super::matlab::compile,
    run_command,
    filter_output: identity,
    filter_stderr,
    readable_dirs: &[],
};

fn run_command(program: &str) -> Vec<String> {
    args(&["/usr/bin/octave", "--norc", "--no-window-system", "--silent", program])
}

/// Keeps only the first error line and hides the temporary source path
fn filter_stderr(stderr: &str) -> String {
    let stderr = stderr.replace('\r', "");
    let stderr = drop_trailing_errors(&stderr);
    hide_source_path(&stderr)
}

/// Everything from the second line starting with `error:` up to the last
/// newline is collapsed into a single newline
fn drop_trailing_errors(stderr: &str) -> String {
    let Some(start) = stderr.find("\nerror:") else {
        return stderr.to_string();
    };
    match stderr.rfind('\n') {
        Some(end) if end > start => format!("{}\n{}", &stderr[..start], &stderr[end + 1..]),
        _ => stderr.to_string(),
    }
}

fn hide_source_path(stderr: &str) -> String {
    stderr
        .split('\n')
        .map(|line| match line.find("file /") {
            Some(pos) if line[pos..].contains("/coderunner_") => {
                format!("{}source file", &line[..pos])
            }
            _ => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_error_kept() {
        let stderr = "error: 'x' undefined\r\nerror: called from\nerror: near line 3\n";
        assert_eq!(filter_stderr(stderr), "error: 'x' undefined\n");
    }

    #[test]
    fn test_temp_path_hidden() {
        let stderr = "parse error near line 2 of file /tmp/work/coderunner_ab12/sourceFile.m\n";
        assert_eq!(
            filter_stderr(stderr),
            "parse error near line 2 of source file\n"
        );
    }
}
