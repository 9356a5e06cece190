//! Redaction engine
//!
//! Patterns are compiled once per route when the catalog loads. A pattern is
//! one of:
//!
//! - a built-in name: `email`, `api_key`, `ip`, `phone`
//! - `re:<body>`, compiled case-insensitively
//! - `/<body>/<flags>` with flags from `imsx` (`g` and `u` accepted and ignored)
//! - anything else, matched as a case-insensitive literal
//!
//! Detection runs every rule once over the text. `block` mode stops there;
//! `warn` mode replaces each match with the rule's tag.

use crate::domain::RedactionMode;
use regex::{NoExpand, Regex};
use thiserror::Error;

const CUSTOM_TAG: &str = "[REDACTED]";

const BUILTINS: &[(&str, &str, &str)] = &[
    (
        "email",
        r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
        "[REDACTED_EMAIL]",
    ),
    (
        "api_key",
        r"\b(?:sk|pk|rk)-[A-Za-z0-9_-]{16,}|\bAKIA[0-9A-Z]{16}\b|\bgh[pousr]_[A-Za-z0-9]{36}\b",
        "[REDACTED_API_KEY]",
    ),
    (
        "ip",
        r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
        "[REDACTED_IP]",
    ),
    (
        "phone",
        r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\b\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b",
        "[REDACTED_PHONE]",
    ),
];

#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("invalid redaction pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unsupported flag '{flag}' in redaction pattern '{pattern}'")]
    UnsupportedFlag { pattern: String, flag: char },
}

#[derive(Debug, Clone)]
struct RedactionRule {
    name: String,
    regex: Regex,
    tag: &'static str,
}

/// Result of running the engine over candidate text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactionOutcome {
    Passed { output: String, applied: bool },
    Blocked { matched: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct Redactor {
    rules: Vec<RedactionRule>,
}

impl Redactor {
    /// Compile a route's patterns. An empty list enables every built-in.
    pub fn compile(patterns: &[String]) -> Result<Self, RedactionError> {
        let mut rules = Vec::new();
        if patterns.is_empty() {
            for (name, body, tag) in BUILTINS {
                rules.push(builtin_rule(name, body, tag)?);
            }
            return Ok(Self { rules });
        }

        for raw in patterns {
            let pattern = raw.trim();
            if pattern.is_empty() {
                continue;
            }
            if let Some((name, body, tag)) = BUILTINS.iter().find(|(name, _, _)| *name == pattern) {
                rules.push(builtin_rule(name, body, tag)?);
                continue;
            }
            let source = custom_regex_source(pattern)?;
            let regex = Regex::new(&source).map_err(|source| RedactionError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            rules.push(RedactionRule {
                name: pattern.to_string(),
                regex,
                tag: CUSTOM_TAG,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Names of every rule that matches somewhere in `text`
    pub fn detect(&self, text: &str) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| rule.regex.is_match(text))
            .map(|rule| rule.name.clone())
            .collect()
    }

    pub fn redact(&self, text: &str, mode: RedactionMode) -> RedactionOutcome {
        if mode == RedactionMode::Off {
            return RedactionOutcome::Passed {
                output: text.to_string(),
                applied: false,
            };
        }

        let matched: Vec<&RedactionRule> = self
            .rules
            .iter()
            .filter(|rule| rule.regex.is_match(text))
            .collect();
        if matched.is_empty() {
            return RedactionOutcome::Passed {
                output: text.to_string(),
                applied: false,
            };
        }

        if mode == RedactionMode::Block {
            return RedactionOutcome::Blocked {
                matched: matched.iter().map(|rule| rule.name.clone()).collect(),
            };
        }

        let output = matched.iter().fold(text.to_string(), |acc, rule| {
            rule.regex.replace_all(&acc, NoExpand(rule.tag)).into_owned()
        });
        RedactionOutcome::Passed {
            output,
            applied: true,
        }
    }
}

fn builtin_rule(
    name: &str,
    body: &str,
    tag: &'static str,
) -> Result<RedactionRule, RedactionError> {
    let regex = Regex::new(body).map_err(|source| RedactionError::InvalidPattern {
        pattern: name.to_string(),
        source,
    })?;
    Ok(RedactionRule {
        name: name.to_string(),
        regex,
        tag,
    })
}

fn custom_regex_source(pattern: &str) -> Result<String, RedactionError> {
    if let Some(body) = pattern.strip_prefix("re:") {
        return Ok(format!("(?i){body}"));
    }

    if let Some(rest) = pattern.strip_prefix('/') {
        if let Some(end) = rest.rfind('/') {
            let (body, flags) = (&rest[..end], &rest[end + 1..]);
            let mut inline = String::new();
            for flag in flags.chars() {
                match flag {
                    'i' | 'm' | 's' | 'x' => {
                        if !inline.contains(flag) {
                            inline.push(flag);
                        }
                    }
                    'g' | 'u' => {}
                    other => {
                        return Err(RedactionError::UnsupportedFlag {
                            pattern: pattern.to_string(),
                            flag: other,
                        })
                    }
                }
            }
            return Ok(if inline.is_empty() {
                body.to_string()
            } else {
                format!("(?{inline}){body}")
            });
        }
    }

    Ok(format!("(?i){}", regex::escape(pattern)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn block_mode_stops_on_email() {
        let redactor = Redactor::compile(&patterns(&["email"])).unwrap();
        let outcome = redactor.redact("contact me at user@example.com", RedactionMode::Block);
        assert_eq!(
            outcome,
            RedactionOutcome::Blocked {
                matched: vec!["email".to_string()]
            }
        );
    }

    #[test]
    fn warn_mode_scrubs_with_rule_tag() {
        let redactor = Redactor::compile(&patterns(&["email"])).unwrap();
        let outcome = redactor.redact("contact me at user@example.com", RedactionMode::Warn);
        assert_eq!(
            outcome,
            RedactionOutcome::Passed {
                output: "contact me at [REDACTED_EMAIL]".to_string(),
                applied: true
            }
        );
    }

    #[test]
    fn off_mode_is_a_no_op() {
        let redactor = Redactor::compile(&patterns(&["email"])).unwrap();
        let outcome = redactor.redact("user@example.com", RedactionMode::Off);
        assert_eq!(
            outcome,
            RedactionOutcome::Passed {
                output: "user@example.com".to_string(),
                applied: false
            }
        );
    }

    #[rstest]
    #[case("api_key", "key sk-abcdefghijklmnopqrstuvwx here", "key [REDACTED_API_KEY] here")]
    #[case("ip", "host 10.0.12.255 down", "host [REDACTED_IP] down")]
    #[case("phone", "call 555-867-5309 now", "call [REDACTED_PHONE] now")]
    #[case("re:secret-\\d+", "code SECRET-42", "code [REDACTED]")]
    #[case("/proj(ect)?-x/i", "the PROJECT-X plan", "the [REDACTED] plan")]
    #[case("Falcon.Gate", "see falcon.gate and FalconXGate", "see [REDACTED] and FalconXGate")]
    fn pattern_syntaxes(#[case] pattern: &str, #[case] text: &str, #[case] expected: &str) {
        let redactor = Redactor::compile(&patterns(&[pattern])).unwrap();
        match redactor.redact(text, RedactionMode::Warn) {
            RedactionOutcome::Passed { output, applied } => {
                assert!(applied);
                assert_eq!(output, expected);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn slash_syntax_without_flags_is_case_sensitive() {
        let redactor = Redactor::compile(&patterns(&["/Internal/"])).unwrap();
        assert!(redactor.detect("internal memo").is_empty());
        assert_eq!(redactor.detect("Internal memo"), vec!["/Internal/".to_string()]);
    }

    #[test]
    fn replacement_text_is_not_expanded() {
        let redactor = Redactor::compile(&patterns(&["re:(a)(b)"])).unwrap();
        let RedactionOutcome::Passed { output, .. } = redactor.redact("xab", RedactionMode::Warn)
        else {
            panic!("expected pass");
        };
        assert_eq!(output, "x[REDACTED]");
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(matches!(
            Redactor::compile(&patterns(&["re:(unclosed"])),
            Err(RedactionError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Redactor::compile(&patterns(&["/abc/q"])),
            Err(RedactionError::UnsupportedFlag { flag: 'q', .. })
        ));
    }

    #[test]
    fn empty_pattern_list_enables_builtins() {
        let redactor = Redactor::compile(&[]).unwrap();
        let found = redactor.detect("mail a@b.io from 192.168.1.1");
        assert_eq!(found, vec!["email".to_string(), "ip".to_string()]);
    }
}
