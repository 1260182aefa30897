//! URL templates and identifier parsing

use crate::error::{BronzeError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use url::Url;

const PLACEHOLDERS: [&str; 2] = ["{id}", "{}"];

/// A URL with exactly one integer placeholder (`{}` or `{id}`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    prefix: String,
    suffix: String,
}

impl UrlTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let invalid = |reason: &str| BronzeError::Template {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let (placeholder, start) = PLACEHOLDERS
            .iter()
            .find_map(|p| template.find(p).map(|i| (*p, i)))
            .ok_or_else(|| invalid("missing '{}' placeholder"))?;

        let prefix = &template[..start];
        let suffix = &template[start + placeholder.len()..];
        if PLACEHOLDERS.iter().any(|p| suffix.contains(p) || prefix.contains(p)) {
            return Err(invalid("more than one placeholder"));
        }
        if !prefix.starts_with("http://") && !prefix.starts_with("https://") {
            return Err(invalid("must be an http(s) URL"));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Derive a template from an example URL ending in a numeric path segment
    ///
    /// `https://host/api/teams/123` becomes `https://host/api/teams/{}`.
    pub fn from_example(url: &str) -> Result<Self> {
        static TRAILING_ID: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = TRAILING_ID
            .get_or_init(|| Regex::new(r"^(?P<prefix>.*?/)(?P<id>\d+)/?$").ok())
            .as_ref()
            .ok_or_else(|| BronzeError::Config("trailing id pattern failed to compile".into()))?;

        let captures = pattern.captures(url).ok_or_else(|| BronzeError::Template {
            template: url.to_string(),
            reason: "example URL does not end with a numeric path segment".to_string(),
        })?;
        Self::parse(&format!("{}{{}}", &captures["prefix"]))
    }

    pub fn render(&self, identifier: i64) -> String {
        format!("{}{}{}", self.prefix, identifier, self.suffix)
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{}}{}", self.prefix, self.suffix)
    }
}

/// Trailing numeric path segment of a URL (`.../teams/42` -> 42)
pub fn identifier_from_url(url: &str) -> Option<i64> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    last.parse().ok()
}

/// Set the `page` query parameter, keeping every other parameter in place
pub fn with_page(mut url: Url, page: u32) -> String {
    let others: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &others {
            query.append_pair(k, v);
        }
        query.append_pair("page", &page.to_string());
    }
    url.into()
}
