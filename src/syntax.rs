//! Command-line argument joining.
//!
//! On Unix the argv vector is handed to the OS as-is and joining is only
//! used for logging. On Windows the child receives a single command line,
//! and [`join`] produces one that the native parser splits back into the
//! original argv: arguments are quoted when they contain whitespace,
//! quotes, or nothing at all; backslashes are doubled when they precede a
//! quote (literal or closing) and left alone otherwise.

/// Which joining rules to apply when a raw command line is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgumentSyntax {
    /// Native behavior: argv on Unix, Windows rules on Windows (default).
    #[default]
    Platform,
    /// Force the Windows joining rules.
    Windows,
}

/// Join arguments into a single command line under the Windows rules.
#[must_use]
pub fn join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for arg in args {
        if !line.is_empty() {
            line.push(' ');
        }
        escape_into(arg.as_ref(), &mut line);
    }
    line
}

/// Append one argument, quoted if the parser would otherwise split or
/// alter it.
fn escape_into(arg: &str, out: &mut String) {
    let needs_quoting =
        arg.is_empty() || arg.chars().any(|c| c == ' ' || c == '\t' || c == '\n' || c == '"');
    if !needs_quoting {
        out.push_str(arg);
        return;
    }
    out.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Backslashes before a quote escape; the quote itself
                // needs one more.
                for _ in 0..(backslashes * 2 + 1) {
                    out.push('\\');
                }
                out.push('"');
                backslashes = 0;
            }
            other => {
                for _ in 0..backslashes {
                    out.push('\\');
                }
                out.push(other);
                backslashes = 0;
            }
        }
    }
    // Backslashes before the closing quote must not escape it.
    for _ in 0..(backslashes * 2) {
        out.push('\\');
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test-side model of the native parser: splits a command line the way
    /// `CommandLineToArgvW` documents it.
    fn parse(line: &str) -> Vec<String> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut in_arg = false;
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let mut backslashes = 1usize;
                    while chars.peek() == Some(&'\\') {
                        chars.next();
                        backslashes += 1;
                    }
                    if chars.peek() == Some(&'"') {
                        for _ in 0..(backslashes / 2) {
                            current.push('\\');
                        }
                        if backslashes % 2 == 1 {
                            chars.next();
                            current.push('"');
                        }
                    } else {
                        for _ in 0..backslashes {
                            current.push('\\');
                        }
                    }
                    in_arg = true;
                }
                '"' => {
                    in_quotes = !in_quotes;
                    in_arg = true;
                }
                ' ' | '\t' | '\n' if !in_quotes => {
                    if in_arg {
                        args.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                other => {
                    current.push(other);
                    in_arg = true;
                }
            }
        }
        if in_arg {
            args.push(current);
        }
        args
    }

    fn round_trips(args: &[&str]) {
        let joined = join(args);
        let parsed = parse(&joined);
        assert_eq!(parsed, args, "joined as {joined:?}");
    }

    #[test]
    fn plain_arguments_stay_verbatim() {
        assert_eq!(join(["echo", "hello"]), "echo hello");
    }

    #[test]
    fn whitespace_forces_quoting() {
        assert_eq!(join(["a b"]), "\"a b\"");
        assert_eq!(join(["tab\there"]), "\"tab\there\"");
    }

    #[test]
    fn empty_argument_is_quoted() {
        assert_eq!(join(["x", "", "y"]), "x \"\" y");
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(join(["say \"hi\""]), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn backslashes_before_quotes_are_doubled() {
        assert_eq!(join(["a\\\" b"]), "\"a\\\\\\\" b\"");
        assert_eq!(join(["trail \\"]), "\"trail \\\\\"");
    }

    #[test]
    fn awkward_arguments_round_trip() {
        round_trips(&[
            "c:\\temp",
            "a\\\\b",
            "\\\\\\",
            "``\"`\\\\",
            "C:\\temp\\blah",
            " leading and trailing\twhitespace!  ",
        ]);
    }

    #[test]
    fn empty_and_quote_heavy_arguments_round_trip() {
        round_trips(&["", "\"", "\"\"", "\\\"", "a \"b\" c\\", "  "]);
    }
}
