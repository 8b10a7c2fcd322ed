//! Hostname pattern parsing and matching (`spec.md` §4.6, §6).
//!
//! Each label in a pattern is either a literal string or a pure capture
//! `{name}`; mixed literal/capture content within one label is rejected.
//! Separately, the allowed-domains list uses its own, simpler wildcard
//! syntax (`*`, `*.d`, or an exact string) described in §4.6.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty hostname pattern")]
    Empty,

    #[error("label {0:?} mixes literal text with a capture")]
    MixedLabel(String),

    #[error("unterminated capture in label {0:?}")]
    Unterminated(String),

    #[error("duplicate capture name {0:?}")]
    DuplicateCapture(String),

    #[error("target {0:?} references undefined capture {1:?}")]
    UndefinedCapture(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Label {
    Literal(String),
    Capture(String),
}

/// A parsed hostname pattern, e.g. `{instance}.example.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    labels: Vec<Label>,
}

impl HostPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }
        let mut labels = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for part in raw.split('.') {
            let label = parse_label(part)?;
            if let Label::Capture(name) = &label {
                if !seen.insert(name.clone()) {
                    return Err(PatternError::DuplicateCapture(name.clone()));
                }
            }
            labels.push(label);
        }
        Ok(Self { labels })
    }

    /// True if this pattern has no captures, i.e. it names one literal
    /// hostname. `spec.md` §4.6: instance existence is only checked eagerly
    /// for literal hostnames; patterns defer the check to request time.
    pub fn is_literal(&self) -> bool {
        self.labels.iter().all(|l| matches!(l, Label::Literal(_)))
    }

    /// Matches `hostname` against this pattern, returning the captured
    /// values keyed by capture name on success.
    pub fn matches(&self, hostname: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = hostname.split('.').collect();
        if parts.len() != self.labels.len() {
            return None;
        }
        let mut captures = HashMap::new();
        for (label, part) in self.labels.iter().zip(parts.iter()) {
            match label {
                Label::Literal(l) => {
                    if l != part {
                        return None;
                    }
                }
                Label::Capture(name) => {
                    captures.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(captures)
    }

    /// Substitutes every `{name}` in `target` with its captured value.
    /// Every name referenced in `target` must be defined by this pattern.
    pub fn resolve_target(&self, target: &str) -> Result<(), PatternError> {
        let defined: std::collections::HashSet<&str> = self
            .labels
            .iter()
            .filter_map(|l| match l {
                Label::Capture(name) => Some(name.as_str()),
                Label::Literal(_) => None,
            })
            .collect();
        for reference in extract_braces(target) {
            if !defined.contains(reference.as_str()) {
                return Err(PatternError::UndefinedCapture(
                    target.to_string(),
                    reference,
                ));
            }
        }
        Ok(())
    }

    /// Substitutes captures into `target`, e.g. `{instance}-svc` with
    /// `captures={"instance": "web"}` becomes `"web-svc"`.
    pub fn expand(target: &str, captures: &HashMap<String, String>) -> String {
        let mut out = String::with_capacity(target.len());
        let mut chars = target.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '{' {
                let mut name = String::new();
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        break;
                    }
                    name.push(c2);
                }
                if let Some(value) = captures.get(&name) {
                    out.push_str(value);
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}

fn parse_label(part: &str) -> Result<Label, PatternError> {
    if part.starts_with('{') {
        if !part.ends_with('}') {
            return Err(PatternError::Unterminated(part.to_string()));
        }
        let name = &part[1..part.len() - 1];
        if name.is_empty() || name.contains('{') || name.contains('}') {
            return Err(PatternError::MixedLabel(part.to_string()));
        }
        Ok(Label::Capture(name.to_string()))
    } else if part.contains('{') || part.contains('}') {
        Err(PatternError::MixedLabel(part.to_string()))
    } else {
        Ok(Label::Literal(part.to_string()))
    }
}

fn extract_braces(target: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = target.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut name = String::new();
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    break;
                }
                name.push(c2);
            }
            names.push(name);
        }
    }
    names
}

/// `spec.md` §4.6 "Allowed domains": `*` allows anything, `*.d` matches
/// exactly one label under `d`, anything else matches literally.
pub fn hostname_allowed(hostname: &str, allowed_csv: &str) -> bool {
    allowed_csv
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|pattern| domain_matches(hostname, pattern))
}

fn domain_matches(hostname: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match hostname.strip_suffix(suffix).and_then(|p| p.strip_suffix('.')) {
            Some(label) => !label.is_empty() && !label.contains('.'),
            None => false,
        };
    }
    hostname == pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_only_itself() {
        let p = HostPattern::parse("api.ex.com").unwrap();
        assert!(p.is_literal());
        assert!(p.matches("api.ex.com").is_some());
        assert!(p.matches("other.ex.com").is_none());
    }

    #[test]
    fn single_capture_label_captures_value() {
        let p = HostPattern::parse("{instance}.example.com").unwrap();
        assert!(!p.is_literal());
        let caps = p.matches("web.example.com").unwrap();
        assert_eq!(caps.get("instance"), Some(&"web".to_string()));
        assert!(p.matches("a.b.example.com").is_none());
    }

    #[test]
    fn mixed_literal_and_capture_label_rejected() {
        let err = HostPattern::parse("pre{instance}.example.com").unwrap_err();
        assert!(matches!(err, PatternError::MixedLabel(_)));
    }

    #[test]
    fn duplicate_capture_name_rejected() {
        let err = HostPattern::parse("{x}.{x}.example.com").unwrap_err();
        assert_eq!(err, PatternError::DuplicateCapture("x".to_string()));
    }

    #[test]
    fn target_referencing_undefined_capture_rejected() {
        let p = HostPattern::parse("{instance}.example.com").unwrap();
        assert!(p.resolve_target("{instance}").is_ok());
        assert!(matches!(
            p.resolve_target("{missing}"),
            Err(PatternError::UndefinedCapture(_, _))
        ));
    }

    #[test]
    fn expand_substitutes_captured_values() {
        let mut caps = HashMap::new();
        caps.insert("instance".to_string(), "web".to_string());
        assert_eq!(HostPattern::expand("{instance}", &caps), "web");
        assert_eq!(HostPattern::expand("svc-{instance}", &caps), "svc-web");
    }

    // spec.md §8 scenario 5.
    #[test]
    fn wildcard_domain_check() {
        let allowed = "*.example.com,example.com";
        assert!(hostname_allowed("api.example.com", allowed));
        assert!(hostname_allowed("example.com", allowed));
        assert!(!hostname_allowed("a.b.example.com", allowed));
        assert!(!hostname_allowed("api.example.org", allowed));
    }

    #[test]
    fn bare_star_allows_anything() {
        assert!(hostname_allowed("anything.at.all", "*"));
    }
}
