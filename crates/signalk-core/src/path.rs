//! SignalK path and context matching.
//!
//! Paths and contexts are dot-separated strings like "navigation.speedOverGround"
//! or "vessels.urn:mrn:imo:mmsi:244123456". Subscriptions and rate-limit
//! overrides refer to them through patterns that may contain `*` at any
//! segment.

/// Split a context into its object kind and identifier.
///
/// Only the first `.` separates: `vessels.urn:mrn:imo:mmsi:1.2` yields
/// `("vessels", Some("urn:mrn:imo:mmsi:1.2"))`. A context without a dot is
/// returned whole as the kind.
pub fn split_context(context: &str) -> (&str, Option<&str>) {
    match context.split_once('.') {
        Some((kind, id)) if !id.is_empty() => (kind, Some(id)),
        Some((kind, _)) => (kind, None),
        None => (context, None),
    }
}

/// Split a value path into its segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    Literal(String),
    /// Matches one segment mid-pattern, any non-empty suffix at the end.
    Wildcard,
}

/// A subscription pattern that may contain wildcards.
///
/// Supported patterns:
/// - Exact: "navigation.speedOverGround"
/// - Suffix wildcard: "navigation.*"
/// - Mid-path wildcard: "propulsion.*.revolutions"
/// - Full wildcard: "*"
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PatternSegment>,
    trailing_wildcard: bool,
}

impl PathPattern {
    /// Compile a pattern string.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(PatternError::EmptySegment(pattern.to_string()));
        }

        let segments: Vec<PatternSegment> = parts
            .iter()
            .map(|&s| match s {
                "*" => PatternSegment::Wildcard,
                lit => PatternSegment::Literal(lit.to_string()),
            })
            .collect();

        Ok(Self {
            raw: pattern.to_string(),
            trailing_wildcard: segments.last() == Some(&PatternSegment::Wildcard),
            segments,
        })
    }

    /// A pattern matching everything.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            segments: vec![PatternSegment::Wildcard],
            trailing_wildcard: true,
        }
    }

    /// True if this is the bare `*` pattern.
    pub fn is_any(&self) -> bool {
        self.segments.len() == 1 && self.trailing_wildcard
    }

    /// True if the pattern contains no wildcard.
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    /// Check if a path matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        if self.is_any() {
            return true;
        }

        let parts: Vec<&str> = path.split('.').collect();
        let n = self.segments.len();

        if self.trailing_wildcard {
            // the trailing `*` needs at least one segment to consume
            if parts.len() < n {
                return false;
            }
        } else if parts.len() != n {
            return false;
        }

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PatternSegment::Literal(lit) => {
                    if parts[i] != lit {
                        return false;
                    }
                }
                PatternSegment::Wildcard => {
                    if parts[i].is_empty() {
                        return false;
                    }
                    if self.trailing_wildcard && i == n - 1 {
                        return true;
                    }
                }
            }
        }

        true
    }

    /// Get the raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Errors that can occur when creating a path pattern.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("Empty pattern")]
    EmptyPattern,
    #[error("Pattern {0:?} has an empty segment")]
    EmptySegment(String),
}
