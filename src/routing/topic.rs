//! Topic names and subscription filters as validated level sequences.
//!
//! A topic is one or more `/`-separated levels; levels may be empty, so
//! `/a` has two levels (the first empty) and `a/` has a trailing empty
//! level. Filters additionally admit the single-level wildcard `+` and the
//! multi-level wildcard `#`, the latter only in final position.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    #[error("invalid topic")]
    InvalidTopic,
    #[error("invalid filter")]
    InvalidFilter,
}

/// Concrete `/`-separated address used when publishing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic {
    levels: Vec<String>,
}

impl Topic {
    /// Parse a topic name. Wildcard characters and NUL are rejected
    /// anywhere; the empty string is rejected; empty levels are not.
    pub fn parse(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic);
        }
        let mut levels = Vec::new();
        for level in s.split('/') {
            if level.contains(['+', '#', '\0']) {
                return Err(TopicError::InvalidTopic);
            }
            levels.push(level.to_string());
        }
        Ok(Topic { levels })
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels.join("/"))
    }
}

/// One level of a subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterLevel {
    Literal(String),
    /// `+`: matches exactly one topic level, including an empty one.
    SingleWildcard,
    /// `#`: matches the remainder of the topic, including zero levels.
    MultiWildcard,
}

/// Topic pattern used when subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    levels: Vec<FilterLevel>,
}

impl Filter {
    /// Parse a subscription filter. `#` is accepted only as the final
    /// level and may not be followed by anything, not even `/`.
    pub fn parse(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidFilter);
        }
        let segments: Vec<&str> = s.split('/').collect();
        let last = segments.len() - 1;
        let mut levels = Vec::with_capacity(segments.len());
        for (idx, segment) in segments.iter().enumerate() {
            match *segment {
                "+" => levels.push(FilterLevel::SingleWildcard),
                "#" => {
                    if idx != last {
                        return Err(TopicError::InvalidFilter);
                    }
                    levels.push(FilterLevel::MultiWildcard);
                }
                literal => {
                    if literal.contains(['+', '#', '\0']) {
                        return Err(TopicError::InvalidFilter);
                    }
                    levels.push(FilterLevel::Literal(literal.to_string()));
                }
            }
        }
        Ok(Filter { levels })
    }

    pub fn levels(&self) -> &[FilterLevel] {
        &self.levels
    }

    /// Whether this filter matches the given topic, under the same rules
    /// the routing trie applies: a literal matches an equal level, `+`
    /// matches any single level, and a trailing `#` matches the rest of
    /// the topic including zero additional levels.
    pub fn matches(&self, topic: &Topic) -> bool {
        fn step(filter: &[FilterLevel], topic: &[String]) -> bool {
            match filter.split_first() {
                None => topic.is_empty(),
                Some((FilterLevel::MultiWildcard, _)) => true,
                Some((head, rest)) => match topic.split_first() {
                    None => false,
                    Some((level, remaining)) => match head {
                        FilterLevel::SingleWildcard => step(rest, remaining),
                        FilterLevel::Literal(lit) => lit == level && step(rest, remaining),
                        FilterLevel::MultiWildcard => unreachable!(),
                    },
                },
            }
        }
        step(&self.levels, topic.levels())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, level) in self.levels.iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            match level {
                FilterLevel::Literal(lit) => f.write_str(lit)?,
                FilterLevel::SingleWildcard => f.write_str("+")?,
                FilterLevel::MultiWildcard => f.write_str("#")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic_levels(s: &str) -> Vec<String> {
        Topic::parse(s).unwrap().levels().to_vec()
    }

    #[test]
    fn rejects_invalid_topics() {
        assert_eq!(Topic::parse(""), Err(TopicError::InvalidTopic));
        assert_eq!(Topic::parse("\0"), Err(TopicError::InvalidTopic));
        assert_eq!(Topic::parse("+"), Err(TopicError::InvalidTopic));
        assert_eq!(Topic::parse("#"), Err(TopicError::InvalidTopic));
        assert_eq!(Topic::parse("a/+/b"), Err(TopicError::InvalidTopic));
    }

    #[test]
    fn splits_topic_levels_including_empties() {
        assert_eq!(topic_levels("/"), vec!["", ""]);
        assert_eq!(topic_levels("//"), vec!["", "", ""]);
        assert_eq!(topic_levels("/a"), vec!["", "a"]);
        assert_eq!(topic_levels("a"), vec!["a"]);
        assert_eq!(topic_levels("a/"), vec!["a", ""]);
        assert_eq!(topic_levels("a/b123"), vec!["a", "b123"]);
    }

    #[test]
    fn filter_wildcards_parse() {
        assert_eq!(
            Filter::parse("+").unwrap().levels(),
            &[FilterLevel::SingleWildcard]
        );
        assert_eq!(
            Filter::parse("#").unwrap().levels(),
            &[FilterLevel::MultiWildcard]
        );
        let f = Filter::parse("a/+/c123/#").unwrap();
        assert_eq!(
            f.levels(),
            &[
                FilterLevel::Literal("a".into()),
                FilterLevel::SingleWildcard,
                FilterLevel::Literal("c123".into()),
                FilterLevel::MultiWildcard,
            ]
        );
    }

    #[test]
    fn multi_wildcard_must_be_final() {
        assert_eq!(Filter::parse("#/"), Err(TopicError::InvalidFilter));
        assert_eq!(Filter::parse("a/+/c123/#/d"), Err(TopicError::InvalidFilter));
        assert_eq!(Filter::parse("a/#/b"), Err(TopicError::InvalidFilter));
        assert_eq!(Filter::parse(""), Err(TopicError::InvalidFilter));
    }

    #[test]
    fn display_round_trips() {
        for raw in ["/", "//", "/a", "a", "a/", "a/b123", "x/y/z"] {
            let topic = Topic::parse(raw).unwrap();
            assert_eq!(Topic::parse(&topic.to_string()).unwrap(), topic);
            assert_eq!(topic.to_string(), raw);
        }
        for raw in ["+", "#", "a/+/c123/#", "/+"] {
            let filter = Filter::parse(raw).unwrap();
            assert_eq!(filter.to_string(), raw);
        }
    }

    #[test]
    fn filter_matching_rules() {
        let t = |s| Topic::parse(s).unwrap();
        let f = |s| Filter::parse(s).unwrap();
        assert!(f("#").matches(&t("a/b/c")));
        assert!(f("#").matches(&t("/a")));
        assert!(f("a/#").matches(&t("a")));
        assert!(f("a/#").matches(&t("a/b/c")));
        assert!(!f("a/#").matches(&t("b/a")));
        assert!(f("+/x").matches(&t("/x")));
        assert!(f("+/x").matches(&t("a/x")));
        assert!(!f("+/x").matches(&t("x")));
        assert!(!f("+/x").matches(&t("a/b/x")));
        assert!(f("+").matches(&t("a")));
        assert!(!f("+").matches(&t("a/b")));
    }
}
