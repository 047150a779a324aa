//! Topic routing key patterns
//!
//! AMQP-style matching over dot-separated routing keys: `*` matches
//! exactly one segment, `#` matches zero or more segments.

use crate::{BrokerError, Result};

/// A parsed binding pattern for a topic exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    OneWord,
    ZeroOrMore,
}

impl TopicPattern {
    /// Parse a binding key such as `*.odp.save_data` or `dead.odp.#`
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }

        let segments = pattern
            .split('.')
            .map(|s| match s {
                "" => Err(BrokerError::InvalidPattern(pattern.to_string())),
                "*" => Ok(Segment::OneWord),
                "#" => Ok(Segment::ZeroOrMore),
                lit => Ok(Segment::Literal(lit.to_string())),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { segments })
    }

    /// Test a concrete routing key against this pattern
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        Self::matches_at(&self.segments, &words)
    }

    fn matches_at(pattern: &[Segment], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((Segment::Literal(lit), rest)) => words
                .split_first()
                .is_some_and(|(w, ws)| w == lit && Self::matches_at(rest, ws)),
            Some((Segment::OneWord, rest)) => words
                .split_first()
                .is_some_and(|(_, ws)| Self::matches_at(rest, ws)),
            Some((Segment::ZeroOrMore, rest)) => (0..=words.len())
                .any(|skip| Self::matches_at(rest, &words[skip..])),
        }
    }
}
