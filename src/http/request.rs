//! Inbound requests: the parsed wire message and the per-request façade.
//!
//! [`RawRequest`] holds only what the server reads off the connection.
//! [`Request`] is the view handlers work with; it is built from a
//! `RawRequest` by the application and filled in as the request moves
//! through the lifecycle (cookies, body, then route params).

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::body::{self, UploadedFile};
use super::{Extensions, Headers, Method, cookie, negotiate};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,
}

/// The parts of an inbound HTTP message the application consumes.
///
/// Built by the server from the connection buffer with [`RawRequest::parse`],
/// or directly with [`RawRequest::new`] when driving an
/// [`App`](crate::App) without a socket.
///
/// # Examples
///
/// ```
/// use keel::http::RawRequest;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = RawRequest::parse(raw).unwrap();
///
/// assert_eq!(request.method.as_str(), "GET");
/// assert_eq!(request.target, "/hello?name=world");
/// assert_eq!(request.headers.get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    /// The request target as sent, path and query string included.
    pub target: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
    pub peer_addr: Option<SocketAddr>,
    /// Whether the connection is TLS-terminated by this server.
    pub secure: bool,
    pub body: Bytes,
}

impl RawRequest {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a request with no headers and an empty body.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: 1,
            headers: Headers::new(),
            peer_addr: None,
            secure: false,
            body: Bytes::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the body and a matching `Content-Length`.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.headers.set("content-length", self.body.len().to_string());
        self
    }

    /// Sets the peer address.
    #[must_use]
    pub fn peer(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Parse the head of a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `RawRequest` (with an empty body) and the byte
    /// offset at which the body begins in `buf`.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req.method {
            Some(m) => m.parse::<Method>().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };
        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();
        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        Ok((
            Self {
                method,
                target,
                version,
                headers: header_map,
                peer_addr: None,
                secure: false,
                body: Bytes::new(),
            },
            body_offset,
        ))
    }

    /// Returns the declared body length; absent means zero.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidContentLength`] if the header is not a number.
    pub fn content_length(&self) -> Result<usize, RequestError> {
        match self.headers.get("content-length") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| RequestError::InvalidContentLength),
            None => Ok(0),
        }
    }

    /// Returns `true` when the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }
}

/// An ordered string map used for route params and query strings.
///
/// [`insert`](Self::insert) replaces an existing key,
/// [`append`](Self::append) keeps repeated keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Copies every entry of `other` in, replacing existing keys.
    pub fn merge(&mut self, other: Params) {
        for (k, v) in other.entries {
            self.insert(k, v);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parses a URL query string into [`Params`], percent- and `+`-decoding.
fn parse_query(query: &str) -> Params {
    match serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
        Ok(pairs) => {
            let mut params = Params::new();
            for (k, v) in pairs {
                params.append(k, v);
            }
            params
        }
        Err(error) => {
            debug!(%error, "ignoring malformed query string");
            Params::new()
        }
    }
}

/// The per-request view handed to middleware and route handlers.
///
/// # Examples
///
/// ```
/// use keel::http::{Method, RawRequest, Request};
///
/// let raw = RawRequest::new(Method::Get, "/search?q=rust&page=2")
///     .header("Accept", "application/json");
/// let req = Request::new(raw, false);
///
/// assert_eq!(req.path(), "/search");
/// assert_eq!(req.query().get("q"), Some("rust"));
/// assert_eq!(req.accepts(&["html", "json"]), Some("json"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    original_url: String,
    path: String,
    base_url: String,
    version: u8,
    headers: Headers,
    query: Params,
    params: Params,
    cookies: HashMap<String, String>,
    body: Value,
    files: Vec<UploadedFile>,
    raw_body: Bytes,
    peer_addr: Option<SocketAddr>,
    secure: bool,
    trust_proxy: bool,
    /// Free-form per-request data shared between middleware and handlers.
    pub locals: Map<String, Value>,
    /// Typed per-request data.
    pub extensions: Extensions,
}

impl Request {
    /// Builds the façade from a raw message. `trust_proxy` controls whether
    /// `X-Forwarded-*` headers are believed.
    pub fn new(raw: RawRequest, trust_proxy: bool) -> Self {
        let (path, query) = match raw.target.split_once('?') {
            Some((path, query)) => (path.to_owned(), parse_query(query)),
            None => (raw.target.clone(), Params::new()),
        };
        Self {
            method: raw.method,
            original_url: raw.target,
            path,
            base_url: String::new(),
            version: raw.version,
            headers: raw.headers,
            query,
            params: Params::new(),
            cookies: HashMap::new(),
            body: Value::Object(Map::new()),
            files: Vec::new(),
            raw_body: raw.body,
            peer_addr: raw.peer_addr,
            secure: raw.secure,
            trust_proxy,
            locals: Map::new(),
            extensions: Extensions::new(),
        }
    }

    pub(crate) fn parse_cookies(&mut self) {
        if let Some(header) = self.headers.get("cookie") {
            self.cookies = cookie::parse(header);
        }
    }

    pub(crate) async fn parse_body(&mut self) {
        let parsed = body::parse(self.headers.get("content-type"), &self.raw_body).await;
        self.body = parsed.value;
        self.files = parsed.files;
    }

    pub(crate) fn merge_params(&mut self, params: Params) {
        self.params.merge(params);
    }

    /// Re-roots the request under a mount prefix, returning the previous
    /// `(path, base_url)` so it can be restored.
    pub(crate) fn enter_mount(&mut self, prefix: &str) -> (String, String) {
        let rest = match self.path.get(prefix.len()..) {
            Some(rest) if !rest.is_empty() => rest.to_owned(),
            _ => "/".to_owned(),
        };
        let previous = (std::mem::replace(&mut self.path, rest), self.base_url.clone());
        self.base_url.push_str(prefix);
        previous
    }

    pub(crate) fn leave_mount(&mut self, previous: (String, String)) {
        (self.path, self.base_url) = previous;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the path, relative to the router currently handling the request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the mount prefix of the router currently handling the request.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the request target exactly as received.
    pub fn original_url(&self) -> &str {
        &self.original_url
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a header value by name, case-insensitively.
    /// `referrer` and `referer` are interchangeable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn query(&self) -> &Params {
        &self.query
    }

    /// Route parameters. Only the router writes these.
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// The parsed body; an empty object when there was none or it failed to parse.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Deserializes the parsed body into `T`.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the body does not fit `T`.
    pub fn body_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.body.clone())
    }

    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Returns the offered type the client prefers, or `None` if none is
    /// acceptable. Types may be short names (`"json"`) or media types.
    pub fn accepts<'t>(&self, types: &[&'t str]) -> Option<&'t str> {
        negotiate::best_match(self.headers.get("accept"), types)
    }

    /// Returns the first of `types` that the request's `Content-Type` matches.
    pub fn is<'t>(&self, types: &[&'t str]) -> Option<&'t str> {
        negotiate::type_is(self.headers.get("content-type"), types)
    }

    /// The proxy chain from `X-Forwarded-For`, client first. Empty unless
    /// proxies are trusted.
    pub fn ips(&self) -> Vec<String> {
        if !self.trust_proxy {
            return Vec::new();
        }
        self.headers
            .get("x-forwarded-for")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The client address: the first forwarded address when proxies are
    /// trusted, else the socket peer.
    pub fn ip(&self) -> Option<String> {
        self.ips()
            .into_iter()
            .next()
            .or_else(|| self.peer_addr.map(|addr| addr.ip().to_string()))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// `"https"` or `"http"`; honours `X-Forwarded-Proto` when proxies are trusted.
    pub fn protocol(&self) -> &str {
        if self.trust_proxy {
            if let Some(proto) = self.headers.get("x-forwarded-proto") {
                return proto.split(',').next().unwrap_or(proto).trim();
            }
        }
        if self.secure { "https" } else { "http" }
    }

    pub fn secure(&self) -> bool {
        self.protocol() == "https"
    }

    /// Host name without port, from `Host` (or `X-Forwarded-Host` behind a
    /// trusted proxy).
    pub fn hostname(&self) -> Option<&str> {
        let host = self
            .trust_proxy
            .then(|| self.headers.get("x-forwarded-host"))
            .flatten()
            .or_else(|| self.headers.get("host"))?;
        let host = host.split(',').next().unwrap_or(host).trim();
        if host.starts_with('[') {
            // IPv6 literal
            return host.find(']').map(|end| &host[..=end]);
        }
        Some(host.split(':').next().unwrap_or(host))
    }

    /// `true` for requests sent with `X-Requested-With: XMLHttpRequest`.
    pub fn xhr(&self) -> bool {
        self.headers
            .get("x-requested-with")
            .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(raw: RawRequest) -> Request {
        Request::new(raw, false)
    }

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = RawRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/");
        assert_eq!(req.version, 1);
        assert_eq!(req.headers.get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(RawRequest::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn content_length_and_offset() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let (req, body_offset) = RawRequest::parse(raw).unwrap();
        assert_eq!(req.content_length().unwrap(), 5);
        assert_eq!(&raw[body_offset..], b"hello");
    }

    #[test]
    fn bad_content_length() {
        let raw = RawRequest::new(Method::Post, "/").header("Content-Length", "five");
        assert!(matches!(
            raw.content_length(),
            Err(RequestError::InvalidContentLength)
        ));
    }

    #[test]
    fn keep_alive_rules() {
        let (req, _) = RawRequest::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());
        let (req, _) =
            RawRequest::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
        let (req, _) = RawRequest::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn query_is_split_and_decoded() {
        let req = request(RawRequest::new(
            Method::Get,
            "/search?q=hello+world&tag=a&tag=b&x=%2F",
        ));
        assert_eq!(req.path(), "/search");
        assert_eq!(req.original_url(), "/search?q=hello+world&tag=a&tag=b&x=%2F");
        assert_eq!(req.query().get("q"), Some("hello world"));
        assert_eq!(req.query().get_all("tag").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(req.query().get("x"), Some("/"));
    }

    #[test]
    fn header_lookup_is_case_insensitive_with_alias() {
        let req = request(
            RawRequest::new(Method::Get, "/")
                .header("X-Thing", "1")
                .header("Referer", "/prev"),
        );
        assert_eq!(req.get("x-thing"), Some("1"));
        assert_eq!(req.get("Referrer"), Some("/prev"));
    }

    #[test]
    fn cookies_parsed_on_demand() {
        let mut req = request(RawRequest::new(Method::Get, "/").header("Cookie", "a=1; b=two"));
        assert!(req.cookies().is_empty());
        req.parse_cookies();
        assert_eq!(req.cookie("a"), Some("1"));
        assert_eq!(req.cookie("b"), Some("two"));
    }

    #[tokio::test]
    async fn body_parse_failure_leaves_params_untouched() {
        let mut req = request(
            RawRequest::new(Method::Post, "/users/1")
                .header("Content-Type", "application/json")
                .body("{oops"),
        );
        let mut params = Params::new();
        params.insert("id", "1");
        req.merge_params(params);
        req.parse_body().await;
        assert_eq!(req.body(), &json!({}));
        assert_eq!(req.param("id"), Some("1"));
        assert_eq!(&req.raw_body()[..], b"{oops");
    }

    #[tokio::test]
    async fn body_as_deserializes() {
        #[derive(serde::Deserialize)]
        struct Login {
            user: String,
        }
        let mut req = request(
            RawRequest::new(Method::Post, "/login")
                .header("Content-Type", "application/json")
                .body(r#"{"user":"ada"}"#),
        );
        req.parse_body().await;
        let login: Login = req.body_as().unwrap();
        assert_eq!(login.user, "ada");
    }

    #[test]
    fn is_checks_content_type() {
        let req = request(
            RawRequest::new(Method::Post, "/").header("Content-Type", "text/html; charset=utf-8"),
        );
        assert_eq!(req.is(&["json", "html"]), Some("html"));
        assert_eq!(req.is(&["json"]), None);
    }

    #[test]
    fn ip_ignores_forwarded_for_unless_trusted() {
        let addr: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let raw = RawRequest::new(Method::Get, "/")
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .peer(addr);

        let untrusted = Request::new(raw.clone(), false);
        assert_eq!(untrusted.ip().as_deref(), Some("10.0.0.9"));
        assert!(untrusted.ips().is_empty());

        let trusted = Request::new(raw, true);
        assert_eq!(trusted.ip().as_deref(), Some("203.0.113.7"));
        assert_eq!(trusted.ips(), vec!["203.0.113.7", "10.0.0.1"]);
    }

    #[test]
    fn hostname_and_protocol() {
        let raw = RawRequest::new(Method::Get, "/")
            .header("Host", "example.com:8080")
            .header("X-Forwarded-Proto", "https")
            .header("X-Forwarded-Host", "public.example");
        let req = Request::new(raw.clone(), false);
        assert_eq!(req.hostname(), Some("example.com"));
        assert_eq!(req.protocol(), "http");
        assert!(!req.secure());

        let req = Request::new(raw, true);
        assert_eq!(req.hostname(), Some("public.example"));
        assert_eq!(req.protocol(), "https");

        let req = request(RawRequest::new(Method::Get, "/").header("Host", "[::1]:3000"));
        assert_eq!(req.hostname(), Some("[::1]"));
    }

    #[test]
    fn mount_strips_and_restores_prefix() {
        let mut req = request(RawRequest::new(Method::Get, "/api/users/7"));
        let saved = req.enter_mount("/api");
        assert_eq!(req.path(), "/users/7");
        assert_eq!(req.base_url(), "/api");
        req.leave_mount(saved);
        assert_eq!(req.path(), "/api/users/7");
        assert_eq!(req.base_url(), "");

        let saved = req.enter_mount("/api/users/7");
        assert_eq!(req.path(), "/");
        req.leave_mount(saved);
    }

    #[test]
    fn params_insert_replaces_append_keeps() {
        let mut p = Params::new();
        p.insert("a", "1");
        p.insert("a", "2");
        p.append("b", "1");
        p.append("b", "2");
        assert_eq!(p.get("a"), Some("2"));
        assert_eq!(p.get_all("b").count(), 2);
        assert_eq!(p.len(), 3);
    }
}
