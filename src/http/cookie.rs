//! `Cookie` request header parsing and `Set-Cookie` serialization.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Value of `Expires` used by [`Response::clear_cookie`](crate::Response::clear_cookie).
pub(crate) const EPOCH_HTTP_DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        })
    }
}

/// Attributes attached to a cookie set through
/// [`Response::cookie`](crate::Response::cookie).
///
/// The default path is `/`; everything else is unset.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use keel::http::{CookieOptions, SameSite};
///
/// let opts = CookieOptions::new()
///     .http_only(true)
///     .secure(true)
///     .same_site(SameSite::Strict)
///     .max_age(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct CookieOptions {
    max_age: Option<Duration>,
    expires: Option<String>,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            max_age: None,
            expires: None,
            domain: None,
            path: Some("/".to_owned()),
            secure: false,
            http_only: false,
            same_site: None,
        }
    }
}

impl CookieOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Sets `Expires` to an already formatted HTTP date.
    #[must_use]
    pub fn expires(mut self, http_date: impl Into<String>) -> Self {
        self.expires = Some(http_date.into());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    #[must_use]
    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Produces the attributes that expire a cookie immediately while keeping
    /// the scope (`path`, `domain`) it was set with.
    pub(crate) fn expired(&self) -> Self {
        Self {
            max_age: Some(Duration::ZERO),
            expires: Some(EPOCH_HTTP_DATE.to_owned()),
            ..self.clone()
        }
    }
}

/// Renders a `Set-Cookie` header value. The value is percent-encoded.
pub(crate) fn serialize(name: &str, value: &str, opts: &CookieOptions) -> String {
    let mut out = format!("{name}={}", urlencoding::encode(value));
    if let Some(max_age) = opts.max_age {
        out.push_str(&format!("; Max-Age={}", max_age.as_secs()));
    }
    if let Some(domain) = &opts.domain {
        out.push_str(&format!("; Domain={domain}"));
    }
    if let Some(path) = &opts.path {
        out.push_str(&format!("; Path={path}"));
    }
    if let Some(expires) = &opts.expires {
        out.push_str(&format!("; Expires={expires}"));
    }
    if opts.http_only {
        out.push_str("; HttpOnly");
    }
    if opts.secure {
        out.push_str("; Secure");
    }
    if let Some(same_site) = opts.same_site {
        out.push_str(&format!("; SameSite={same_site}"));
    }
    out
}

/// Parses a `Cookie` request header into a name → value map.
///
/// Values are unquoted and percent-decoded; the first occurrence of a name
/// wins. Pairs without `=` are ignored.
pub(crate) fn parse(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || cookies.contains_key(name) {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        let decoded = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_owned());
        cookies.insert(name.to_owned(), decoded);
    }
    cookies
}
