//! Output normalisation shared by the graders

/// Display strings longer than this many bytes are snipped
pub const MAX_STRING_LENGTH: usize = 8000;

const SNIP_INSERT: &str = " ...snip... ";

/// Removes trailing spaces on every line and trailing blank lines
///
/// Non-empty results end with exactly one newline. Carriage returns, tabs
/// and other control characters are escaped so they show up in feedback.
pub fn clean(s: &str) -> String {
    let mut output = String::with_capacity(s.len() + 1);
    let mut pending_newlines = 0;
    let mut pending_spaces = 0;

    for c in s.chars() {
        match c {
            ' ' => pending_spaces += 1,
            '\n' => {
                pending_spaces = 0;
                pending_newlines += 1;
            }
            _ => {
                output.extend(std::iter::repeat_n('\n', pending_newlines));
                output.extend(std::iter::repeat_n(' ', pending_spaces));
                pending_newlines = 0;
                pending_spaces = 0;
                match c {
                    '\r' => output.push_str("\\r"),
                    '\t' => output.push_str("\\t"),
                    c if c.is_control() => output.push_str(&format!("\\x{:02x}", c as u32)),
                    c => output.push(c),
                }
            }
        }
    }

    if !output.is_empty() {
        output.push('\n');
    }
    output
}

/// Bounds `s` to [`MAX_STRING_LENGTH`] bytes by cutting out its middle
pub fn snip(s: &str) -> String {
    let len = s.len();
    if len <= MAX_STRING_LENGTH {
        return s.to_string();
    }
    let part = (MAX_STRING_LENGTH - SNIP_INSERT.len()) / 2;
    let mut head_end = part;
    while !s.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = len - part;
    while !s.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!("{}{SNIP_INSERT}{}", &s[..head_end], &s[tail_start..])
}

/// [`clean`] followed by [`snip`], for anything shown to students
pub fn tidy(s: &str) -> String {
    snip(&clean(s))
}

/// Whitespace- and case-insensitive form used by the near-equality grader
///
/// Runs of spaces and tabs become one space, trailing whitespace goes, blank
/// lines disappear (which also covers runs of them and a leading one) and
/// everything is lowercased.
pub fn reduce(s: &str) -> String {
    s.split('\n')
        .map(reduce_line)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase()
}

fn reduce_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_space = false;
    for c in line.chars() {
        if c == ' ' || c == '\t' {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out.truncate(out.trim_end().len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_trailing_whitespace() {
        assert_eq!(clean("a  \nb\n\n\n"), "a\nb\n");
        assert_eq!(clean("\n\nx"), "\n\nx\n");
        assert_eq!(clean("   \n\n"), "");
        assert_eq!(clean(""), "");
    }

    #[test]
    fn test_clean_escapes_control_characters() {
        assert_eq!(clean("a\tb\r\n"), "a\\tb\\r\n");
        assert_eq!(clean("\x07"), "\\x07\n");
        assert_eq!(clean("héllo"), "héllo\n");
    }

    #[test]
    fn test_snip_bounds_length() {
        let long = "x".repeat(MAX_STRING_LENGTH * 2);
        let snipped = snip(&long);
        assert!(snipped.len() <= MAX_STRING_LENGTH);
        assert!(snipped.contains(SNIP_INSERT));
        assert_eq!(snip("short"), "short");
    }

    #[test]
    fn test_snip_respects_char_boundaries() {
        let long = "é".repeat(MAX_STRING_LENGTH);
        let snipped = snip(&long);
        assert!(snipped.len() <= MAX_STRING_LENGTH);
        assert!(snipped.starts_with('é'));
    }

    #[test]
    fn test_reduce_ignores_spacing_and_case() {
        assert_eq!(reduce("\nHello   World\t \n\n\nBye\n\n"), "hello world\nbye");
        assert_eq!(reduce("hello world\nbye\n"), reduce("\nHELLO\t\tworld  \n\nbye"));
    }

    #[test]
    fn test_reduce_is_idempotent() {
        for s in ["\n A  b\t\tC \n\n\nd\n\n", "", "\n\n", "x\ty"] {
            let once = reduce(s);
            assert_eq!(reduce(&once), once);
        }
    }
}
