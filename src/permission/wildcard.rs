//! Glob-style matching for permission patterns.
//!
//! `*` matches any run of characters (including none and including newlines),
//! `?` matches exactly one character, everything else is literal. A pattern
//! ending in `" *"` also matches the bare prefix, so `"ls *"` matches `"ls"`.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;

/// Compiled patterns, including failures so a bad pattern warns once.
static COMPILED: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();

/// Whether `value` matches the glob `pattern`.
pub fn matches(value: &str, pattern: &str) -> bool {
    compile(pattern).is_some_and(|re| re.is_match(value))
}

/// Action of the most specific pattern matching `value`.
///
/// Patterns are tried from shortest to longest (ties broken lexically) and
/// the last match wins, so a longer pattern overrides a broader one.
pub fn all<'a, A, I>(value: &str, patterns: I) -> Option<A>
where
    A: Clone + 'a,
    I: IntoIterator<Item = (&'a str, &'a A)>,
{
    let mut sorted: Vec<(&str, &A)> = patterns.into_iter().collect();
    sorted.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(b.0)));
    sorted
        .into_iter()
        .filter(|(pattern, _)| matches(value, pattern))
        .last()
        .map(|(_, action)| action.clone())
}

/// A shell-like target split into its command head and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structured<'a> {
    pub head: &'a str,
    pub tail: Vec<&'a str>,
}

impl<'a> Structured<'a> {
    /// Split on ASCII whitespace; an empty command yields an empty head.
    pub fn parse(command: &'a str) -> Self {
        let mut words = command.split_whitespace();
        let head = words.next().unwrap_or_default();
        Self {
            head,
            tail: words.collect(),
        }
    }
}

/// Like [`all`] but matches word by word.
///
/// The first pattern word is globbed against the head; each remaining pattern
/// word is globbed against one argument, except a lone `*` which consumes any
/// number of arguments.
pub fn all_structured<'a, A, I>(input: &Structured<'_>, patterns: I) -> Option<A>
where
    A: Clone + 'a,
    I: IntoIterator<Item = (&'a str, &'a A)>,
{
    let mut sorted: Vec<(&str, &A)> = patterns.into_iter().collect();
    sorted.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(b.0)));
    sorted
        .into_iter()
        .filter(|(pattern, _)| {
            let words: Vec<&str> = pattern.split_whitespace().collect();
            match words.split_first() {
                Some((head, rest)) => {
                    matches(input.head, head) && match_sequence(&input.tail, rest)
                }
                None => false,
            }
        })
        .last()
        .map(|(_, action)| action.clone())
}

fn match_sequence(items: &[&str], patterns: &[&str]) -> bool {
    match patterns.split_first() {
        None => items.is_empty(),
        Some((&"*", rest)) => (0..=items.len()).any(|skip| match_sequence(&items[skip..], rest)),
        Some((pattern, rest)) => match items.split_first() {
            Some((item, remaining)) => matches(item, pattern) && match_sequence(remaining, rest),
            None => false,
        },
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    let cache = COMPILED.get_or_init(Default::default);
    let mut cache = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    cache
        .entry(pattern.to_string())
        .or_insert_with(|| build(pattern))
        .clone()
}

fn build(pattern: &str) -> Option<Regex> {
    let mut body = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    if body.ends_with(" .*") {
        body.truncate(body.len() - 3);
        body.push_str("( .*)?");
    }
    match Regex::new(&format!("(?s)^{body}$")) {
        Ok(re) => Some(re),
        Err(err) => {
            tracing::warn!(pattern, error = %err, "invalid permission pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn trailing_argument_is_optional() {
        assert!(matches("ls -la", "ls *"));
        assert!(matches("ls", "ls *"));
        assert!(!matches("lsof", "ls *"));
        assert!(!matches("foo", "bar"));
    }

    #[test]
    fn star_and_question_mark() {
        assert!(matches("src/main.rs", "src/*.rs"));
        assert!(matches("src/a/b.rs", "src/*"));
        assert!(matches("a.rs", "?.rs"));
        assert!(!matches("ab.rs", "?.rs"));
        assert!(matches("line1\nline2", "line1*"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(matches("a+b(c).txt", "a+b(c).txt"));
        assert!(!matches("aab.txt", "a+b.txt"));
        assert!(matches("price $5", "price $*"));
    }

    #[test]
    fn longest_matching_pattern_wins() {
        let rules: HashMap<&str, &str> = HashMap::from([
            ("*", "allow"),
            ("git *", "ask"),
            ("git push *", "deny"),
        ]);
        let lookup = |value: &str| all(value, rules.iter().map(|(k, v)| (*k, v)));
        assert_eq!(lookup("git push origin"), Some("deny"));
        assert_eq!(lookup("git status"), Some("ask"));
        assert_eq!(lookup("cargo build"), Some("allow"));
    }

    #[test]
    fn no_match_yields_none() {
        let rules = [("npm *", 1)];
        assert_eq!(all("cargo", rules.iter().map(|(k, v)| (*k, v))), None);
    }

    #[test]
    fn ties_are_broken_lexically() {
        let rules = [("ab*", "second"), ("a*b", "first")];
        assert_eq!(all("ab", rules.iter().map(|(k, v)| (*k, v))), Some("second"));
    }

    #[test]
    fn structured_matching_walks_arguments() {
        let rules = [("git *", "ask"), ("git push *", "deny"), ("rm -rf *", "deny")];
        let lookup = |cmd: &str| {
            all_structured(&Structured::parse(cmd), rules.iter().map(|(k, v)| (*k, v)))
        };
        assert_eq!(lookup("git push origin main"), Some("deny"));
        assert_eq!(lookup("git log"), Some("ask"));
        assert_eq!(lookup("git"), Some("ask"));
        assert_eq!(lookup("rm -rf /tmp/x"), Some("deny"));
        assert_eq!(lookup("rm file"), None);
    }

    #[test]
    fn compiled_patterns_are_reused() {
        let pattern = "cached-pattern-* ?";
        assert!(matches("cached-pattern-x y", pattern));
        let cached = COMPILED.get().unwrap().lock().unwrap().get(pattern).cloned().flatten();
        assert_eq!(cached.unwrap().as_str(), compile(pattern).unwrap().as_str());
        assert!(!matches("cached-pattern-x", pattern));
    }
}
