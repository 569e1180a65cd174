//! Topic name and filter rules
//!
//! Names are concrete publish topics and never carry wildcards. Filters may
//! use `+` for one whole level and `#` for the whole remainder. Topics that
//! start with `$` are invisible to filters that start with a wildcard.

use std::fmt;

/// Longest topic or filter an MQTT string can carry
const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Why a topic name or filter was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    TooLong,
    NullCharacter,
    WildcardInName,
    /// `+` or `#` sharing a level with other characters
    PartialWildcard,
    /// `#` followed by more levels
    HashNotLast,
    /// `$share/...` filters are managed by the engine, not configured
    SharedFilter,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TopicError::Empty => "must not be empty",
            TopicError::TooLong => "exceeds the maximum topic length",
            TopicError::NullCharacter => "must not contain a null character",
            TopicError::WildcardInName => "topic names cannot contain wildcards",
            TopicError::PartialWildcard => "wildcards must occupy an entire level",
            TopicError::HashNotLast => "'#' must be the last level",
            TopicError::SharedFilter => "shared subscription filters are not allowed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TopicError {}

fn check_text(s: &str) -> Result<(), TopicError> {
    if s.is_empty() {
        Err(TopicError::Empty)
    } else if s.len() > MAX_TOPIC_LEN {
        Err(TopicError::TooLong)
    } else if s.contains('\0') {
        Err(TopicError::NullCharacter)
    } else {
        Ok(())
    }
}

/// Validate a concrete topic a message is published on
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    check_text(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a filter used by a bridge subscription or exclusion
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_text(filter)?;
    if filter.starts_with("$share/") {
        return Err(TopicError::SharedFilter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            "#" if index == last => {}
            "#" => return Err(TopicError::HashNotLast),
            other if other.contains(['+', '#']) => return Err(TopicError::PartialWildcard),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match (level, topic_levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (expected, Some(actual)) if expected == actual => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}
