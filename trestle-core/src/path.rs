//! Path binding.
//!
//! A [`PathBinder`] is compiled from a pattern made of literal text and
//! token segments:
//!
//! | Segment        | Matches                                          |
//! |----------------|--------------------------------------------------|
//! | `users`        | the literal text                                 |
//! | `:id`          | one segment, captured as `id`                    |
//! | `:id?`         | an optional trailing segment                     |
//! | `:id:[0-9]+`   | one segment matching the regex, captured as `id` |
//! | `::[a-z]+`     | one segment matching the regex, not captured     |
//! | trailing `*`   | anything, leaving it for nested bindings         |
//!
//! Binding happens against the unconsumed remainder of the enclosing
//! binding, so nested path handlers only see what their parents left over.

use crate::Error;
use crate::logging::trace;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|/)(?:::([^/]+)|:(\w+)(\?)?(?::([^/]+))?)")
        .unwrap_or_else(|e| unreachable!("placeholder pattern is valid: {e}"))
});

/// Captured token values, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTokens {
    entries: Vec<(String, String)>,
}

impl PathTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Parse a token value.
    pub fn parse<T: FromStr>(&self, name: &str) -> Option<Result<T, T::Err>> {
        self.get(name).map(str::parse)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.entries.iter().cloned().collect()
    }

    /// Insert or replace, keeping the original position of replaced keys.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    fn overlay(&self, other: &PathTokens) -> PathTokens {
        let mut merged = self.clone();
        for (name, value) in other.iter() {
            merged.insert(name, value);
        }
        merged
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PathTokens {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tokens = PathTokens::new();
        for (name, value) in iter {
            tokens.insert(name, value);
        }
        tokens
    }
}

/// The result of a successful bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBinding {
    bound_to: String,
    past_binding: String,
    tokens: PathTokens,
    all_tokens: PathTokens,
}

impl PathBinding {
    /// Build a binding from the path that was matched and the part of it
    /// the pattern consumed.
    pub fn new(path: &str, binding: &str, tokens: PathTokens, parent: Option<&PathBinding>) -> Self {
        let past_binding = path
            .get(binding.len()..)
            .map(|rest| rest.strip_prefix('/').unwrap_or(rest))
            .unwrap_or_default()
            .to_string();

        let own = binding.strip_suffix('/').unwrap_or(binding);
        let bound_to = match parent {
            Some(parent) if !parent.bound_to.is_empty() => {
                if own.is_empty() {
                    parent.bound_to.clone()
                } else {
                    format!("{}/{}", parent.bound_to, own)
                }
            }
            _ => own.to_string(),
        };

        let all_tokens = match parent {
            Some(parent) => parent.all_tokens.overlay(&tokens),
            None => tokens.clone(),
        };

        Self {
            bound_to,
            past_binding,
            tokens,
            all_tokens,
        }
    }

    /// A binding of the whole request path, as installed before any path
    /// handler runs.
    pub fn root(path: &str) -> Self {
        Self::new(path, "", PathTokens::new(), None)
    }

    /// Everything matched so far, including enclosing bindings.
    pub fn bound_to(&self) -> &str {
        &self.bound_to
    }

    /// The part of the path left for nested bindings, without a leading `/`.
    pub fn past_binding(&self) -> &str {
        &self.past_binding
    }

    /// Tokens captured by this binding only.
    pub fn tokens(&self) -> &PathTokens {
        &self.tokens
    }

    /// Tokens captured by this binding and every enclosing one. Inner
    /// tokens replace outer tokens of the same name.
    pub fn all_tokens(&self) -> &PathTokens {
        &self.all_tokens
    }
}

enum Segment {
    Literal(String),
    LiteralPattern(String),
    Token {
        name: String,
        pattern: Option<String>,
        optional: bool,
    },
}

/// A compiled path pattern.
#[derive(Clone)]
pub struct PathBinder {
    description: String,
    regex: Regex,
    token_names: Vec<String>,
    exact: bool,
}

impl PathBinder {
    /// Compile `pattern`. With `exact`, the whole remaining path must be
    /// consumed (one trailing `/` is tolerated); otherwise the pattern only
    /// has to match a prefix ending on a segment boundary.
    pub fn parse(pattern: &str, exact: bool) -> Result<Self, Error> {
        let trimmed = pattern.trim_start_matches('/');
        let (trimmed, exact) = match trimmed.strip_suffix('*') {
            Some(rest) if rest.is_empty() || rest.ends_with('/') => {
                (rest.trim_end_matches('/'), false)
            }
            _ => (trimmed, exact),
        };

        let segments = Self::segments(trimmed)?;

        let mut source = String::from("^(?P<bound>");
        let mut token_names = Vec::new();
        let mut seen_optional = false;

        for segment in &segments {
            match segment {
                Segment::Literal(text) => source.push_str(&regex::escape(text)),
                Segment::LiteralPattern(pattern) => {
                    source.push_str(&format!("(?:(?:^|/)(?:{pattern}))"));
                }
                Segment::Token {
                    name,
                    pattern,
                    optional,
                } => {
                    if seen_optional && !optional {
                        return Err(Error::InvalidPathPattern(format!(
                            "{trimmed}: mandatory token :{name} after an optional token"
                        )));
                    }
                    if token_names.contains(name) {
                        return Err(Error::InvalidPathPattern(format!(
                            "{trimmed}: duplicate token :{name}"
                        )));
                    }
                    seen_optional |= *optional;

                    let group = format!("t{}", token_names.len());
                    let body = match (pattern, optional) {
                        (Some(custom), _) => custom.clone(),
                        (None, false) => "[^/?&#]+".to_string(),
                        (None, true) => "[^/?&#]*".to_string(),
                    };
                    source.push_str(&format!("(?:(?:^|/)(?P<{group}>{body}))"));
                    if *optional {
                        source.push('?');
                    }
                    token_names.push(name.clone());
                }
            }
        }

        source.push(')');
        source.push_str(match (exact, segments.is_empty()) {
            (true, _) => "(?:/|$)$",
            (false, true) => ".*$",
            (false, false) => "(?:/.*)?$",
        });

        let compiled = Regex::new(&source)
            .map_err(|e| Error::InvalidPathPattern(format!("{trimmed}: {e}")))?;

        trace!(pattern = trimmed, regex = %source, exact, "Compiled path binder");

        Ok(Self {
            description: trimmed.to_string(),
            regex: compiled,
            token_names,
            exact,
        })
    }

    fn segments(pattern: &str) -> Result<Vec<Segment>, Error> {
        let mut segments = Vec::new();
        let mut last = 0;

        for captures in PLACEHOLDER.captures_iter(pattern) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(pattern[last..whole.start()].to_string()));
            }
            last = whole.end();

            if let Some(literal) = captures.get(1) {
                segments.push(Segment::LiteralPattern(literal.as_str().to_string()));
            } else if let Some(name) = captures.get(2) {
                segments.push(Segment::Token {
                    name: name.as_str().to_string(),
                    pattern: captures.get(4).map(|p| p.as_str().to_string()),
                    optional: captures.get(3).is_some(),
                });
            } else {
                return Err(Error::InvalidPathPattern(format!(
                    "cannot parse {:?} in {pattern}",
                    whole.as_str()
                )));
            }
        }

        if last < pattern.len() {
            segments.push(Segment::Literal(pattern[last..].to_string()));
        }
        Ok(segments)
    }

    /// Bind against `path`, or against the remainder of `parent` if given.
    pub fn bind(&self, path: &str, parent: Option<&PathBinding>) -> Option<PathBinding> {
        let path = match parent {
            Some(parent) => parent.past_binding(),
            None => path.trim_start_matches('/'),
        };

        let captures = self.regex.captures(path)?;
        let bound = captures.name("bound").map_or("", |m| m.as_str());

        let mut tokens = PathTokens::new();
        for (index, name) in self.token_names.iter().enumerate() {
            if let Some(value) = captures.name(&format!("t{index}")) {
                tokens.insert(name.clone(), decode_component(value.as_str()));
            }
        }

        Some(PathBinding::new(path, bound, tokens, parent))
    }

    pub fn token_names(&self) -> &[String] {
        &self.token_names
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }
}

impl fmt::Debug for PathBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathBinder")
            .field("pattern", &self.description)
            .field("exact", &self.exact)
            .finish()
    }
}

impl fmt::Display for PathBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Percent-decode a path component. `+` is kept as-is; invalid UTF-8 leaves
/// the value undecoded.
pub fn decode_component(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
