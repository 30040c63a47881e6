//! Pure pattern matching over query keys.
//!
//! Glob patterns support `*` as a wildcard matching any sequence of
//! characters, so `tasks:list:*` addresses every filtered task list.

use super::QueryKey;

/// Checks if a serialized key matches a glob pattern.
///
/// # Examples
///
/// ```
/// use concierge_core::cache::pattern_matches;
///
/// assert!(pattern_matches("tasks:detail:t1", "tasks:detail:t1"));
/// assert!(pattern_matches("tasks:list:*", "tasks:list:property_id=eq.p1"));
/// assert!(pattern_matches("*:detail:*", "jobs:detail:j1"));
/// assert!(!pattern_matches("tasks:list:*", "jobs:list:all"));
/// ```
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    if pattern.is_empty() {
        return key.is_empty();
    }

    if pattern == "*" {
        return true;
    }

    let segments: Vec<&str> = pattern.split('*').collect();

    // No wildcard at all
    if segments.len() == 1 {
        return pattern == key;
    }

    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let last = segments.len() - 1;
    let mut remaining = key;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }

        if i == 0 && anchored_start {
            match remaining.strip_prefix(segment) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if i == last && anchored_end {
            return remaining.ends_with(segment);
        } else {
            match remaining.find(segment) {
                Some(pos) => remaining = &remaining[pos + segment.len()..],
                None => return false,
            }
        }
    }

    true
}

/// A set of query keys addressed by an invalidation or projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Exactly one key.
    Exact(QueryKey),
    /// Every key matching a glob.
    Glob(String),
}

impl KeyPattern {
    pub fn exact(key: QueryKey) -> Self {
        KeyPattern::Exact(key)
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        KeyPattern::Glob(pattern.into())
    }

    /// Returns true if the key is addressed by this pattern.
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            KeyPattern::Exact(exact) => exact == key,
            KeyPattern::Glob(pattern) => pattern_matches(pattern, key.as_str()),
        }
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPattern::Exact(key) => write!(f, "{}", key),
            KeyPattern::Glob(pattern) => f.write_str(pattern),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(pattern_matches("properties:detail:p1", "properties:detail:p1"));
        assert!(!pattern_matches("properties:detail:p1", "properties:detail:p2"));
    }

    #[test]
    fn test_wildcard_at_end() {
        assert!(pattern_matches("tasks:list:*", "tasks:list:all"));
        assert!(pattern_matches("tasks:list:*", "tasks:list:"));
        assert!(pattern_matches(
            "tasks:list:*",
            "tasks:list:property_id=eq.p1&status=eq.pending"
        ));
        assert!(!pattern_matches("tasks:list:*", "tasks:detail:t1"));
    }

    #[test]
    fn test_wildcard_at_start() {
        assert!(pattern_matches("*:detail:p1", "properties:detail:p1"));
        assert!(!pattern_matches("*:detail:p1", "properties:detail:p2"));
    }

    #[test]
    fn test_wildcard_in_middle() {
        assert!(pattern_matches("tasks:*:all", "tasks:list:all"));
        assert!(!pattern_matches("tasks:*:all", "tasks:list:some"));
        assert!(!pattern_matches("tasks:*:all", "jobs:list:all"));
    }

    #[test]
    fn test_multiple_and_adjacent_wildcards() {
        assert!(pattern_matches("*:list:*", "invoices:list:all"));
        assert!(pattern_matches("tasks:**:all", "tasks:list:all"));
        assert!(pattern_matches("**", "anything"));
        assert!(!pattern_matches("*:middle:*", "start:other:end"));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(pattern_matches("", ""));
        assert!(!pattern_matches("", "tasks"));
        assert!(pattern_matches("*", ""));
        assert!(!pattern_matches("tasks:*", ""));
    }

    #[test]
    fn test_key_pattern_exact_does_not_glob() {
        let key = QueryKey::new("tasks").with("detail").with("*");
        let other = QueryKey::new("tasks").with("detail").with("t1");
        let pattern = KeyPattern::exact(key.clone());
        assert!(pattern.matches(&key));
        assert!(!pattern.matches(&other));
    }

    #[test]
    fn test_key_pattern_display() {
        assert_eq!(KeyPattern::glob("tasks:list:*").to_string(), "tasks:list:*");
        let key = QueryKey::new("tasks").with("detail").with("t1");
        assert_eq!(KeyPattern::exact(key).to_string(), "tasks:detail:t1");
    }
}
