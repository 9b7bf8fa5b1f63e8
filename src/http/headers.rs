//! HTTP header map with case-normalized names.
//!
//! Names are lowercased once on insertion, so lookups are plain string
//! comparisons. A small alias table folds historically misspelled names
//! onto their canonical form.

use std::fmt;

// (alias, canonical)
const ALIASES: &[(&str, &str)] = &[("referrer", "referer")];

/// Lowercases `name` and resolves it through the alias table.
pub(crate) fn normalize(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match ALIASES.iter().find(|(alias, _)| *alias == lower) {
        Some((_, canonical)) => (*canonical).to_owned(),
        None => lower,
    }
}

/// An order-preserving, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use keel::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.append("Content-Type", "text/html; charset=utf-8");
/// headers.append("X-Custom", "first");
/// headers.append("X-Custom", "second");
/// headers.append("Referer", "https://example.com/");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// assert_eq!(headers.get("referrer"), Some("https://example.com/"));
/// let all: Vec<_> = headers.get_all("x-custom").collect();
/// assert_eq!(all, vec!["first", "second"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.inner.push((normalize(name), value.into()));
    }

    /// Replaces every value stored under `name` with a single `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = normalize(name);
        self.inner.retain(|(k, _)| *k != name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for the given header name, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = normalize(name);
        self.inner
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name.
    pub fn get_all(&self, name: &str) -> impl Iterator<Item = &str> + '_ {
        let name = normalize(name);
        self.inner
            .iter()
            .filter(move |(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries with the given header name.
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = normalize(name);
        let before = self.inner.len();
        self.inner.retain(|(k, _)| *k != name);
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased_on_insert() {
        let mut h = Headers::new();
        h.append("Content-Type", "text/plain");
        assert_eq!(h.iter().next(), Some(("content-type", "text/plain")));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn referrer_alias_resolves_both_ways() {
        let mut h = Headers::new();
        h.append("Referrer", "/from");
        assert_eq!(h.get("referer"), Some("/from"));
        assert_eq!(h.get("Referrer"), Some("/from"));
    }

    #[test]
    fn multi_value() {
        let mut h = Headers::new();
        h.append("Set-Cookie", "a=1");
        h.append("Set-Cookie", "b=2");
        let vals: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(vals, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.append("X-Foo", "bar");
        h.append("X-Foo", "baz");
        h.set("x-foo", "qux");
        assert_eq!(h.get_all("X-Foo").collect::<Vec<_>>(), vec!["qux"]);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.append("X-Foo", "bar");
        h.append("X-Foo", "baz");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }
}
