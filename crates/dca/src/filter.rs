//! Event filtering by task, event type and level.
//!
//! A filter is a comma separated list of `<task>.<event type>:<level>` rules,
//! for example `*.*:4,Transport.*:3,Transport.MessageSent:0`. `*` matches any
//! task or event type and `<task>:<level>` is short for `<task>.*:<level>`.
//! Names match case-insensitively.
//!
//! An event is kept when its level is at or below the level of the most
//! specific rule matching it. Level `0` drops everything a rule matches.
//! Events no rule matches are dropped.

use crate::event::DecodedEvent;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Matches any task or event type.
pub const WILDCARD: &str = "*";

/// Filter that keeps everything up to `Informational`.
pub const DEFAULT_FILTER: &str = "*.*:4";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("event filter is empty")]
    Empty,
    #[error("filter rule {0:?} has no ':<level>'")]
    MissingLevel(String),
    #[error("filter rule {0:?} has a level outside 0..=5")]
    InvalidLevel(String),
    #[error("filter rule {0:?} has an empty task or event type")]
    EmptyName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterRule {
    task: Option<String>,
    event_type: Option<String>,
    level: u8,
}

impl FilterRule {
    fn matches(&self, task: &str, event_type: &str) -> bool {
        let names_match = |pattern: &Option<String>, name: &str| pattern.as_deref().map_or(true, |p| p.eq_ignore_ascii_case(name));
        names_match(&self.task, task) && names_match(&self.event_type, event_type)
    }

    /// Exact task outranks exact event type, which outranks wildcards.
    fn specificity(&self) -> u8 {
        u8::from(self.task.is_some()) * 2 + u8::from(self.event_type.is_some())
    }
}

impl FromStr for FilterRule {
    type Err = FilterError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let (names, level) = rule
            .rsplit_once(':')
            .ok_or_else(|| FilterError::MissingLevel(rule.to_string()))?;
        let level: u8 = level
            .trim()
            .parse()
            .ok()
            .filter(|level| *level <= 5)
            .ok_or_else(|| FilterError::InvalidLevel(rule.to_string()))?;

        let (task, event_type) = names.split_once('.').unwrap_or((names, WILDCARD));
        let pattern = |name: &str| -> Result<Option<String>, FilterError> {
            match name.trim() {
                "" => Err(FilterError::EmptyName(rule.to_string())),
                WILDCARD => Ok(None),
                name => Ok(Some(name.to_string())),
            }
        };

        Ok(Self {
            task: pattern(task)?,
            event_type: pattern(event_type)?,
            level,
        })
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}:{}",
            self.task.as_deref().unwrap_or(WILDCARD),
            self.event_type.as_deref().unwrap_or(WILDCARD),
            self.level
        )
    }
}

/// Parsed event filter; see the module docs for the syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    rules: Vec<FilterRule>,
}

impl EventFilter {
    pub fn parse(filter: &str) -> Result<Self, FilterError> {
        filter.parse()
    }

    /// Highest level kept for a task and event type, `None` if no rule matches.
    pub fn max_level(&self, task: &str, event_type: &str) -> Option<u8> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(task, event_type))
            // Later rules win ties.
            .max_by_key(|rule| rule.specificity())
            .map(|rule| rule.level)
    }

    pub fn allows(&self, event: &DecodedEvent) -> bool {
        self.max_level(event.task_name(), event.event_type())
            .is_some_and(|max| event.level() as u8 <= max)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            rules: vec![FilterRule {
                task: None,
                event_type: None,
                level: 4,
            }],
        }
    }
}

impl FromStr for EventFilter {
    type Err = FilterError;

    fn from_str(filter: &str) -> Result<Self, Self::Err> {
        let rules = filter
            .split(',')
            .map(str::trim)
            .filter(|rule| !rule.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<FilterRule>, _>>()?;
        if rules.is_empty() {
            return Err(FilterError::Empty);
        }
        Ok(Self { rules })
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rule}")?;
        }
        Ok(())
    }
}
