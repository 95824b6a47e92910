use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

use super::{Build, LanguageOps, args, identity, run_compiler};

pub(super) static OPS: LanguageOps = LanguageOps {
    name: "java",
    version: "Java",
    compile,
    run_command,
    filter_output: identity,
    filter_stderr: identity,
    readable_dirs: &["/etc", "/usr/lib/jvm", "/proc", "/lib/", "/lib64/", "/usr/lib"],
};

const NO_MAIN_CLASS: &str = "Error: no main class found, or multiple main classes. \
    [Did you write a public class when asked for a non-public one?]";

/// The file must be named after its public class, so find that first
fn compile(workdir: &Path, source_file: &str) -> Result<Build> {
    let source = fs::read_to_string(workdir.join(source_file))?;
    let Some(class) = main_class(&source) else {
        return Ok(Err(NO_MAIN_CLASS.to_string()));
    };

    let java_file = format!("{class}.java");
    if java_file != source_file {
        fs::rename(workdir.join(source_file), workdir.join(&java_file))?;
    }
    let command = args(&["/usr/bin/javac", &java_file]);
    Ok(run_compiler(&command, workdir)?.map(|_| class))
}

fn run_command(program: &str) -> Vec<String> {
    args(&["/usr/bin/java", "-Xrs", "-Xss8m", "-Xmx200m", program])
}

/// Public class name followed by the first `main` after its opening brace,
/// with `public` and `static` in either order
static MAIN_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ms)(?:^|\W)public\s+class\s+(\w+)[^{]*\{.*?(?:public\s(?:[a-z]*\s)*static|static\s(?:[a-z]*\s)*public)\s(?:[a-z]*\s)*void\s+main\s*\(\s*String",
    )
    .expect("main class pattern is valid")
});

/// Name of the single public class that declares a `main(String` method
///
/// Returns None when no class qualifies or more than one does.
pub fn main_class(source: &str) -> Option<String> {
    let mut found = MAIN_CLASS.captures_iter(source);
    let name = found.next()?.get(1)?.as_str().to_string();
    found.next().is_none().then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_single_main_class() {
        let source = r#"
import java.util.Scanner;

public class Hello {
    public static void main(String[] args) {
        System.out.println("hi");
    }
}
"#;
        assert_eq!(main_class(source), Some("Hello".to_string()));
    }

    #[test]
    fn test_helper_classes_without_main_are_ignored() {
        let source = "class Helper { }\npublic class Prog{ public  static void main ( String... a) {} }";
        assert_eq!(main_class(source), Some("Prog".to_string()));
    }

    #[test]
    fn test_no_main_class() {
        assert_eq!(main_class("class Prog { public static void main(String[] a) {} }"), None);
        assert_eq!(main_class("public class Prog { }"), None);
    }

    #[test]
    fn test_multiple_main_classes_rejected() {
        let source = "public class A { public static void main(String[] a) {} }\n\
                      public class B { public static void main(String[] a) {} }";
        assert_eq!(main_class(source), None);
    }

    #[test]
    fn test_identifier_prefix_is_not_a_keyword() {
        let source = "xpublic class A { public static void main(String[] a) {} }";
        assert_eq!(main_class(source), None);
    }

    #[test]
    fn test_class_header_may_extend_or_implement() {
        let extends = "public class Main extends Base { public static void main(String[] a) {} }";
        assert_eq!(main_class(extends), Some("Main".to_string()));

        let implements = "public class Main implements Runnable, Cloneable {\n\
                          public void run() {}\n\
                          public static void main(String[] a) {} }";
        assert_eq!(main_class(implements), Some("Main".to_string()));

        let generic = "public class Box<T> { public static void main(String[] a) {} }";
        assert_eq!(main_class(generic), Some("Box".to_string()));
    }

    #[test]
    fn test_modifiers_in_any_order() {
        let source = "public class Prog { static public void main(String[] a) {} }";
        assert_eq!(main_class(source), Some("Prog".to_string()));

        let source = "public class Prog { public final static synchronized void main(String[] a) {} }";
        assert_eq!(main_class(source), Some("Prog".to_string()));
    }
}
