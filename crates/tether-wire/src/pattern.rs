//! Route patterns matched against request paths.

use regex_lite::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tether_types::{TetherError, TetherResult};

/// What a pattern extracted from a matching path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathInfo {
    /// The raw request path.
    pub path: String,
    /// Captured parameters: positional groups under `"0"`, `"1"`, ... and
    /// named groups under their names.
    pub params: HashMap<String, String>,
}

impl PathInfo {
    /// Path info without captures.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: HashMap::new(),
        }
    }

    /// Look up a captured parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// A predicate over request paths.
pub trait RoutePattern: Send + Sync + fmt::Debug + 'static {
    /// Pattern family, used by the default [`RoutePattern::equals`].
    fn kind(&self) -> &'static str;

    /// Source text of the pattern.
    fn raw(&self) -> &str;

    /// Match a path, returning what was extracted.
    fn match_path(&self, path: &str) -> Option<PathInfo>;

    /// Whether two patterns denote the same route.
    fn equals(&self, other: &dyn RoutePattern) -> bool {
        self.kind() == other.kind() && self.raw() == other.raw()
    }
}

/// Exact string match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringPattern {
    pattern: String,
}

impl StringPattern {
    /// Create a pattern for a non-empty path.
    pub fn new(pattern: impl Into<String>) -> TetherResult<Self> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(TetherError::InvalidArgument(
                "pattern must be a non-empty string".to_string(),
            ));
        }
        Ok(Self { pattern })
    }

    /// Create a shareable pattern.
    pub fn shared(pattern: impl Into<String>) -> TetherResult<Arc<dyn RoutePattern>> {
        Ok(Arc::new(Self::new(pattern)?))
    }
}

impl RoutePattern for StringPattern {
    fn kind(&self) -> &'static str {
        "string"
    }

    fn raw(&self) -> &str {
        &self.pattern
    }

    fn match_path(&self, path: &str) -> Option<PathInfo> {
        (path == self.pattern).then(|| PathInfo::new(path))
    }
}

/// Regular-expression match. Unanchored unless the expression anchors itself.
#[derive(Debug, Clone)]
pub struct RegexPattern {
    regex: Regex,
}

impl RegexPattern {
    /// Compile a pattern.
    pub fn new(expression: &str) -> TetherResult<Self> {
        let regex = Regex::new(expression)
            .map_err(|e| TetherError::InvalidArgument(format!("invalid route pattern: {e}")))?;
        Ok(Self { regex })
    }

    /// Compile a shareable pattern.
    pub fn shared(expression: &str) -> TetherResult<Arc<dyn RoutePattern>> {
        Ok(Arc::new(Self::new(expression)?))
    }
}

impl RoutePattern for RegexPattern {
    fn kind(&self) -> &'static str {
        "regex"
    }

    fn raw(&self) -> &str {
        self.regex.as_str()
    }

    fn match_path(&self, path: &str) -> Option<PathInfo> {
        let captures = self.regex.captures(path)?;
        let mut info = PathInfo::new(path);
        for (index, name) in self.regex.capture_names().enumerate() {
            let Some(group) = captures.get(index) else {
                continue;
            };
            info.params
                .insert(index.to_string(), group.as_str().to_string());
            if let Some(name) = name {
                info.params
                    .insert(name.to_string(), group.as_str().to_string());
            }
        }
        Some(info)
    }
}
