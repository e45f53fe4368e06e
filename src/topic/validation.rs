//! Topic filter validation and matching
//!
//! Key rules:
//! - Multi-level wildcard (#) must be the whole last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are not matched by a leading wildcard
//! - `$share/{group}/` prefixes are stripped before matching

/// Prefix of shared subscription filters
const SHARED_PREFIX: &str = "$share/";

/// Split a shared subscription into `(group, filter)`
fn split_shared(filter: &str) -> Option<Result<(&str, &str), &'static str>> {
    let rest = filter.strip_prefix(SHARED_PREFIX)?;
    Some(match rest.split_once('/') {
        Some(("", _)) => Err("shared subscription group name cannot be empty"),
        Some((group, _)) if group.contains(['+', '#']) => {
            Err("shared subscription group name cannot contain wildcards")
        }
        Some((_, "")) => Err("shared subscription filter cannot be empty"),
        Some(parts) => Ok(parts),
        None => Err("invalid shared subscription format"),
    })
}

/// Validate a topic filter before subscribing
///
/// Filters must be 1..=65535 bytes without NUL characters, and wildcards
/// must occupy whole levels with `#` only in the last one.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let filter = match split_shared(filter) {
        Some(shared) => shared?.1,
        None => filter,
    };

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let filter = match split_shared(filter) {
        Some(Ok((_, actual))) => actual,
        Some(Err(_)) => return false,
        None => filter,
    };

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }

        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
