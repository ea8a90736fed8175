//! Wildcard route matching.
//!
//! Routes and patterns are `/`-separated segments. A `*` segment on either
//! side matches any single segment at the same position. Only the common
//! prefix of the two segment lists is compared, so `bar/*` matches
//! `bar/foo/baz` and `bar/*/foo` also matches `bar/foo`. Existing
//! subscriptions rely on that prefix behavior.

use std::fmt;

/// Segment separator.
pub const SEPARATOR: char = '/';

/// Single-segment wildcard.
pub const WILDCARD: &str = "*";

/// A parsed queue route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<String>,
}

impl RoutePattern {
    /// Parse a pattern. Returns `None` for an empty pattern.
    #[must_use]
    pub fn parse(pattern: &str) -> Option<Self> {
        if pattern.is_empty() {
            return None;
        }
        Some(Self {
            raw: pattern.to_string(),
            segments: pattern.split(SEPARATOR).map(str::to_string).collect(),
        })
    }

    /// The pattern as declared.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether a published route matches this pattern.
    #[must_use]
    pub fn matches(&self, route: &str) -> bool {
        !route.is_empty()
            && segments_match(
                route.split(SEPARATOR),
                self.segments.iter().map(String::as_str),
            )
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Whether `route` matches `pattern`. Empty strings never match.
#[must_use]
pub fn route_matches(route: &str, pattern: &str) -> bool {
    !route.is_empty()
        && !pattern.is_empty()
        && segments_match(route.split(SEPARATOR), pattern.split(SEPARATOR))
}

fn segments_match<'a>(
    route: impl Iterator<Item = &'a str>,
    pattern: impl Iterator<Item = &'a str>,
) -> bool {
    route
        .zip(pattern)
        .all(|(r, p)| r == WILDCARD || p == WILDCARD || r == p)
}
