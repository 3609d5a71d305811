//! URL patterns for routing and cacheability decisions.

use url::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Substring anywhere in the full URL.
    Contains,
    /// Suffix match on the path only (file extensions; query is ignored).
    PathSuffix,
}

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::new(PatternType::Contains, substring)
    }

    /// Create a path suffix pattern, typically a file extension.
    pub fn extension(ext: &str) -> Self {
        Self::new(PatternType::PathSuffix, ext)
    }

    fn new(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        match self.pattern_type {
            PatternType::Contains => url.as_str().contains(&self.pattern),
            PatternType::PathSuffix => url
                .path()
                .to_ascii_lowercase()
                .ends_with(&self.pattern.to_ascii_lowercase()),
        }
    }
}

/// A list of patterns where any match counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<UrlPattern>,
}

impl PatternSet {
    /// Build a set of `Contains` patterns.
    pub fn contains_any<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: needles
                .into_iter()
                .map(|n| UrlPattern::contains(n.as_ref()))
                .collect(),
        }
    }

    /// Build a set of file-extension patterns.
    pub fn extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: extensions
                .into_iter()
                .map(|e| UrlPattern::extension(e.as_ref()))
                .collect(),
        }
    }

    /// True if any pattern matches.
    pub fn matches(&self, url: &Url) -> bool {
        self.patterns.iter().any(|p| p.matches(url))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}
