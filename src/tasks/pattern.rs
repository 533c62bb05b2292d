//! Pattern compiler for command, reply, and message matchers.
//!
//! Authors write patterns with literal spaces; cut-and-paste spacing
//! should never cause a non-match. A literal `" "` therefore compiles
//! to one-or-more whitespace and `" ?"` to zero-or-more, while spaces
//! inside bracketed character classes are preserved verbatim.

use std::sync::LazyLock;

use regex::Regex;

static BRACKET_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*) ([^\]]*)\]").unwrap());

/// Rewrite literal spaces in a raw pattern so they tolerate variable
/// whitespace. Bracketed classes keep their space as `\x20`.
pub fn massage(raw: &str) -> String {
    let guarded = BRACKET_SPACE.replace_all(raw, r"[$1\x20$2]");
    let massaged = guarded.replace(" ?", r"\s*").replace(' ', r"\s+");
    tracing::trace!("massaged pattern '{}' => '{}'", raw, massaged);
    massaged
}

/// Compile a command or reply pattern, anchored to the full normalized
/// message with optional surrounding whitespace.
pub fn compile_anchored(raw: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"^\s*{}\s*$", massage(raw)))
}

/// Compile a message (hear) pattern. These are deliberately left
/// unanchored; a matcher that needs anchors supplies its own.
pub fn compile_unanchored(raw: &str) -> Result<Regex, regex::Error> {
    Regex::new(&massage(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_space_becomes_one_or_more_whitespace() {
        assert_eq!(massage(r"deploy (\w+)"), r"deploy\s+(\w+)");
    }

    #[test]
    fn optional_space_becomes_zero_or_more_whitespace() {
        assert_eq!(massage(r"ping ?pong"), r"ping\s*pong");
    }

    #[test]
    fn bracketed_class_space_is_preserved() {
        assert_eq!(massage(r"[a b]"), r"[a\x20b]");
    }

    #[test]
    fn anchored_pattern_tolerates_run_of_spaces() {
        let re = compile_anchored(r"deploy (\w+)").unwrap();
        assert!(re.is_match("deploy foo"));
        assert!(re.is_match("  deploy    foo "));
        assert!(!re.is_match("please deploy foo"));
        assert!(!re.is_match("deploy foo now"));
    }

    #[test]
    fn anchored_pattern_captures_arguments() {
        let re = compile_anchored(r"deploy (\w+) to (\w+)").unwrap();
        let caps = re.captures("deploy api   to   prod").unwrap();
        assert_eq!(&caps[1], "api");
        assert_eq!(&caps[2], "prod");
    }

    #[test]
    fn unanchored_pattern_matches_inside_message() {
        let re = compile_unanchored(r"build (\d+)").unwrap();
        assert!(re.is_match("heads up, build 42 just finished"));
    }

    #[test]
    fn bracketed_class_still_matches_a_space() {
        let re = compile_anchored(r"say ([a-z ]+)").unwrap();
        let caps = re.captures("say hello there").unwrap();
        assert_eq!(&caps[1], "hello there");
    }

    #[test]
    fn bad_pattern_reports_error() {
        assert!(compile_anchored(r"deploy (\w+").is_err());
        assert!(compile_unanchored(r"[unclosed").is_err());
    }
}
