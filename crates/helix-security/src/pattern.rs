//! Glob-style command patterns.
//!
//! Patterns are literal text except for two wildcards:
//! - `*` matches zero or more arbitrary characters
//! - `?` matches exactly one arbitrary character
//!
//! Every other character (including regex metacharacters such as `.`, `(` or `$`)
//! is matched literally. A compiled pattern performs a full, anchored,
//! case-insensitive match against the candidate command; `git *` matches
//! `git status` but neither `gitstatus` nor `sudo git status`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::error::{PolicyError, Result};

const MAX_CACHED_PATTERNS: usize = 1024;
// Bounds compile cost; pattern length itself is not capped.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

static PATTERN_CACHE: OnceLock<RwLock<HashMap<String, Arc<Regex>>>> = OnceLock::new();

fn pattern_cache() -> &'static RwLock<HashMap<String, Arc<Regex>>> {
    PATTERN_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// A compiled command pattern.
#[derive(Debug, Clone)]
pub struct CommandMatcher {
    pattern: String,
    regex: Arc<Regex>,
}

impl CommandMatcher {
    /// Compile a glob pattern into an anchored, case-insensitive matcher.
    ///
    /// Malformed patterns fail here, never at match time.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.trim().is_empty() {
            return Err(PolicyError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        if let Some(cached) = pattern_cache().read().get(pattern) {
            return Ok(Self {
                pattern: pattern.to_string(),
                regex: Arc::clone(cached),
            });
        }

        let source = glob_to_regex(pattern);
        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|err| PolicyError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            })?;
        let regex = Arc::new(regex);

        let mut cache = pattern_cache().write();
        if cache.len() >= MAX_CACHED_PATTERNS {
            cache.clear();
        }
        cache.insert(pattern.to_string(), Arc::clone(&regex));

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The pattern text this matcher was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Full-string, case-insensitive match.
    pub fn matches(&self, command: &str) -> bool {
        self.regex.is_match(command)
    }
}

/// Compile a list of patterns, skipping (and logging) the ones that fail.
///
/// `location` names the list for the log line, e.g. `global.deny`.
pub fn compile_patterns(patterns: &[String], location: &str) -> Vec<CommandMatcher> {
    patterns
        .iter()
        .filter_map(|pattern| match CommandMatcher::compile(pattern) {
            Ok(matcher) => Some(matcher),
            Err(err) => {
                warn!(location, pattern = %pattern, error = %err, "Skipping invalid pattern");
                None
            }
        })
        .collect()
}

/// Return the first pattern in `patterns` that matches `command`.
///
/// Invalid patterns are skipped; evaluation continues with the rest.
pub fn first_match<'a>(patterns: &'a [String], command: &str, location: &str) -> Option<&'a str> {
    patterns.iter().find_map(|pattern| {
        match CommandMatcher::compile(pattern) {
            Ok(matcher) if matcher.matches(command) => Some(pattern.as_str()),
            Ok(_) => None,
            Err(err) => {
                warn!(location, pattern = %pattern, error = %err, "Skipping invalid pattern");
                None
            }
        }
    })
}

fn glob_to_regex(pattern: &str) -> String {
    let mut source = String::with_capacity(pattern.len() + 8);
    let mut literal = String::new();
    source.push('^');

    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                if !literal.is_empty() {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                }
                source.push_str(if ch == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        source.push_str(&regex::escape(&literal));
    }
    source.push('$');
    source
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, command: &str) -> bool {
        CommandMatcher::compile(pattern).unwrap().matches(command)
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("ls", "ls"));
        assert!(!matches("ls", "cat"));
        assert!(!matches("ls", "ls -la"));
    }

    #[test]
    fn test_wildcard_suffix() {
        assert!(matches("git *", "git status"));
        assert!(matches("git *", "git push origin main"));
        assert!(!matches("git *", "gitstatus"));
        assert!(!matches("git *", "git"));
    }

    #[test]
    fn test_match_is_anchored() {
        assert!(!matches("git *", "sudo git status"));
        assert!(!matches("rm", "rm -rf /"));
    }

    #[test]
    fn test_wildcard_prefix() {
        assert!(matches("*foo", "foo"));
        assert!(matches("*foo", "barfoo"));
        assert!(!matches("*foo", "foobar"));
    }

    #[test]
    fn test_wildcard_middle() {
        assert!(matches("a*b", "ab"));
        assert!(matches("a*b", "aXYZb"));
        assert!(!matches("a*b", "aXYZ"));
        assert!(matches("rm -rf */*", "rm -rf /home/user"));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        assert!(matches("ls -?", "ls -l"));
        assert!(!matches("ls -?", "ls -"));
        assert!(!matches("ls -?", "ls -la"));
    }

    #[test]
    fn test_case_insensitive() {
        assert!(matches("GIT status", "git STATUS"));
        assert!(matches("npm *", "NPM install"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(matches("echo $(date)", "echo $(date)"));
        assert!(!matches("cat a.txt", "cat abtxt"));
        assert!(matches("grep [a-z]+ file", "grep [a-z]+ file"));
        assert!(!matches("grep [a-z]+ file", "grep b file"));
        assert!(matches("^rm|", "^rm|"));
    }

    #[test]
    fn test_wildcard_spans_newlines() {
        assert!(matches("bash -c *", "bash -c 'echo a\necho b'"));
    }

    #[test]
    fn test_empty_pattern_is_invalid() {
        let err = CommandMatcher::compile("   ").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern { .. }));
    }

    #[test]
    fn test_long_pattern_compiles_and_matches() {
        let pattern = format!("curl {}*", "a".repeat(520));
        let matcher = CommandMatcher::compile(&pattern).unwrap();
        assert!(matcher.matches(&format!("curl {} http://evil", "a".repeat(520))));
        assert!(!matcher.matches("curl http://evil"));

        let deny = vec![pattern];
        assert!(first_match(&deny, &format!("curl {}", "a".repeat(520)), "global.deny").is_some());
    }

    #[test]
    fn test_compile_patterns_skips_invalid() {
        let patterns = vec!["git *".to_string(), String::new(), "ls".to_string()];
        let compiled = compile_patterns(&patterns, "global.allow");
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled[0].pattern(), "git *");
        assert_eq!(compiled[1].pattern(), "ls");
    }

    #[test]
    fn test_first_match_continues_past_invalid() {
        let patterns = vec![String::new(), "git *".to_string()];
        assert_eq!(
            first_match(&patterns, "git status", "global.allow"),
            Some("git *")
        );
        assert_eq!(first_match(&patterns, "ls", "global.allow"), None);
    }
}
