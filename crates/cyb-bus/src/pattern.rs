//! Topic routing-key patterns.
//!
//! AMQP wildcard conventions over dot-segmented keys: `*` matches exactly
//! one segment, `#` matches zero or more segments. Patterns are parsed once
//! at binding time and matched per publish.

use std::fmt;

/// One parsed pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Star,
    Hash,
}

/// A parsed topic pattern, e.g. `vsm.s1.*` or `s1.#`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
    source: String,
}

impl TopicPattern {
    /// Parse a pattern. Every string parses; wildcards are only special when
    /// they occupy a whole segment.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|s| match s {
                "*" => Segment::Star,
                "#" => Segment::Hash,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        Self {
            segments,
            source: pattern.to_string(),
        }
    }

    /// The original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the routing key matches this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        matches_from(&self.segments, &key)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn matches_from(pattern: &[Segment], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((Segment::Hash, rest)) => {
            // `#` absorbs zero or more segments.
            (0..=key.len()).any(|skip| matches_from(rest, &key[skip..]))
        },
        Some((segment, rest)) => {
            let Some((head, tail)) = key.split_first() else {
                return false;
            };
            let head_ok = match segment {
                Segment::Star => true,
                Segment::Literal(lit) => lit == head,
                Segment::Hash => unreachable!("handled above"),
            };
            head_ok && matches_from(rest, tail)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        let p = TopicPattern::parse("s1.echo");
        assert!(p.matches("s1.echo"));
        assert!(!p.matches("s1.other"));
        assert!(!p.matches("s1.echo.extra"));
    }

    #[test]
    fn test_star_matches_one_segment() {
        let p = TopicPattern::parse("vsm.s1.*");
        assert!(p.matches("vsm.s1.started"));
        assert!(!p.matches("vsm.s1"));
        assert!(!p.matches("vsm.s1.a.b"));
    }

    #[test]
    fn test_hash_matches_zero_or_more() {
        let p = TopicPattern::parse("s1.#");
        assert!(p.matches("s1"));
        assert!(p.matches("s1.echo"));
        assert!(p.matches("s1.a.b.c"));
        assert!(!p.matches("s2.echo"));
    }

    #[test]
    fn test_hash_in_middle() {
        let p = TopicPattern::parse("a.#.z");
        assert!(p.matches("a.z"));
        assert!(p.matches("a.b.z"));
        assert!(p.matches("a.b.c.z"));
        assert!(!p.matches("a.b.c"));
    }

    #[test]
    fn test_bare_hash_matches_everything() {
        let p = TopicPattern::parse("#");
        assert!(p.matches("anything"));
        assert!(p.matches("a.b.c"));
    }
}
