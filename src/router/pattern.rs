//! Route pattern compilation.
//!
//! | Token     | Regex            | Captures                                  |
//! |-----------|------------------|-------------------------------------------|
//! | literal   | escaped          | *(none)*                                  |
//! | `:name`   | `([^/]+?)`       | `name`                                    |
//! | `/:name?` | `(?:/([^/]+?))?` | `name`, absent when the segment is absent |
//! | `*`       | `(.*)`           | `wildcard`, `wildcard1`, `wildcard2`, ... |
//!
//! The compiled expression is anchored at both ends and trailing slashes
//! are significant: `/users` does not match `/users/`.

use regex::Regex;
use thiserror::Error;

use crate::http::Params;

/// A route pattern that could not be compiled.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("route pattern {pattern:?} must start with '/' or '*'")]
    InvalidStart { pattern: String },

    #[error("route pattern {pattern:?} has an unnamed parameter at byte {position}")]
    EmptyParamName { pattern: String, position: usize },

    #[error("route pattern {pattern:?} declares parameter {name:?} twice")]
    DuplicateParam { pattern: String, name: String },

    #[error("route pattern {pattern:?} did not compile: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// A compiled route pattern.
///
/// # Examples
///
/// ```
/// use keel::router::PathMatcher;
///
/// let m = PathMatcher::compile("/archive/:year?").unwrap();
/// assert_eq!(m.matches("/archive/2024").unwrap().get("year"), Some("2024"));
/// assert!(!m.matches("/archive").unwrap().contains_key("year"));
/// assert!(m.matches("/archive/2024/01").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct PathMatcher {
    pattern: String,
    regex: Regex,
    keys: Vec<String>,
}

impl PathMatcher {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the pattern does not start with `/`
    /// or `*`, has a `:` with no name after it, or repeats a name.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if !(pattern.starts_with('/') || pattern.starts_with('*')) {
            return Err(PatternError::InvalidStart {
                pattern: pattern.to_owned(),
            });
        }

        let mut source = String::with_capacity(pattern.len() + 16);
        source.push('^');
        let mut literal = String::new();
        let mut keys: Vec<String> = Vec::new();
        let mut wildcards = 0usize;

        let push_key = |keys: &mut Vec<String>, name: String| {
            if keys.contains(&name) {
                return Err(PatternError::DuplicateParam {
                    pattern: pattern.to_owned(),
                    name,
                });
            }
            keys.push(name);
            Ok(())
        };

        let mut chars = pattern.char_indices().peekable();
        while let Some((position, c)) = chars.next() {
            match c {
                ':' => {
                    let mut name = String::new();
                    while let Some(&(_, next)) = chars.peek() {
                        if !is_name_char(next) {
                            break;
                        }
                        name.push(next);
                        chars.next();
                    }
                    if name.is_empty() {
                        return Err(PatternError::EmptyParamName {
                            pattern: pattern.to_owned(),
                            position,
                        });
                    }
                    let optional = chars.next_if(|&(_, next)| next == '?').is_some();

                    if optional && literal.ends_with('/') {
                        literal.pop();
                        source.push_str(&regex::escape(&literal));
                        source.push_str("(?:/([^/]+?))?");
                    } else {
                        source.push_str(&regex::escape(&literal));
                        source.push_str(if optional { "([^/]+?)?" } else { "([^/]+?)" });
                    }
                    literal.clear();
                    push_key(&mut keys, name)?;
                }
                '*' => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str("(.*)");
                    let name = match wildcards {
                        0 => "wildcard".to_owned(),
                        n => format!("wildcard{n}"),
                    };
                    wildcards += 1;
                    push_key(&mut keys, name)?;
                }
                c => literal.push(c),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        let regex = Regex::new(&source).map_err(|source| PatternError::Regex {
            pattern: pattern.to_owned(),
            source,
        })?;

        Ok(Self {
            pattern: pattern.to_owned(),
            regex,
            keys,
        })
    }

    /// The pattern as registered.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Capture names in declaration order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Matches `path`, returning the percent-decoded captures. Optional
    /// parameters that did not participate are left out.
    pub fn matches(&self, path: &str) -> Option<Params> {
        let captures = self.regex.captures(path)?;
        let mut params = Params::new();
        for (index, key) in self.keys.iter().enumerate() {
            let Some(found) = captures.get(index + 1) else {
                continue;
            };
            let raw = found.as_str();
            let value = urlencoding::decode(raw)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw.to_owned());
            params.insert(key.as_str(), value);
        }
        Some(params)
    }
}
