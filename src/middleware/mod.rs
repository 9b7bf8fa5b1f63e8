//! Middleware pipeline: ordered, prefix-scoped request processing.
//!
//! Each entry pairs a mount prefix with a [`Middleware`]. For every request
//! the entries whose prefix covers the request path run strictly in
//! registration order. A middleware returns [`Flow::Continue`] to hand the
//! request to the next entry, [`Flow::Sent`] once it has answered, or an
//! error, which stops the chain and goes to the error handler.
//!
//! Prefixes match whole path segments: `/api` covers `/api` and
//! `/api/users` but not `/apiary`. While a prefixed entry runs, the
//! request path is relative to the prefix and
//! [`Request::base_url`](crate::Request::base_url) holds the prefix.
//!
//! A [`Router`] is itself a middleware; mounting one under a prefix gives a
//! sub-application whose unmatched requests continue down the chain.

use tracing::{debug, trace};

use crate::error::HttpError;
use crate::http::{Request, Response};
use crate::router::{BoxFuture, Dispatch, Flow, HandlerResult, Router};

/// The core trait for all middleware.
///
/// Implementations may:
///
/// - **Pass through**: return `Ok(Flow::Continue)`, possibly after
///   decorating the request (`locals`, `extensions`) or response headers.
/// - **Short-circuit**: send a response and return `Ok(Flow::Sent)`.
/// - **Fail**: return an error; the chain stops and the error handler runs.
///
/// # Examples
///
/// ```
/// use keel::middleware::Middleware;
/// use keel::router::{BoxFuture, Flow, HandlerResult};
/// use keel::{Request, Response};
///
/// struct RequireToken(&'static str);
///
/// impl Middleware for RequireToken {
///     fn handle<'a>(&'a self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, HandlerResult> {
///         Box::pin(async move {
///             if req.get("x-token") == Some(self.0) {
///                 return Ok(Flow::Continue);
///             }
///             res.status(401).send("unauthorized")?;
///             Ok(Flow::Sent)
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, HandlerResult>;
}

/// Adapts a closure into a [`Middleware`].
pub struct FnMiddleware<F>(F);

impl<F> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    fn handle<'a>(&'a self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, HandlerResult> {
        (self.0)(req, res)
    }
}

impl Middleware for Router {
    fn handle<'a>(&'a self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            Ok(match self.dispatch(req, res).await? {
                Dispatch::Handled => Flow::Sent,
                Dispatch::NotFound => Flow::Continue,
            })
        })
    }
}

/// Normalizes a mount prefix: leading slash, no trailing slash, `"/"` for root.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

struct MiddlewareEntry {
    prefix: String,
    middleware: Box<dyn Middleware>,
}

impl MiddlewareEntry {
    fn is_root(&self) -> bool {
        self.prefix == "/"
    }

    fn covers(&self, path: &str) -> bool {
        if self.is_root() {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// The ordered middleware list of an application.
#[derive(Default)]
pub struct MiddlewareStack {
    entries: Vec<MiddlewareEntry>,
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| e.prefix.as_str()))
            .finish()
    }
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `middleware` under `prefix`.
    pub fn push(&mut self, prefix: &str, middleware: impl Middleware) {
        let prefix = normalize_prefix(prefix);
        trace!(prefix = %prefix, "middleware registered");
        self.entries.push(MiddlewareEntry {
            prefix,
            middleware: Box::new(middleware),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every entry covering the request path, in order.
    ///
    /// Returns [`Flow::Sent`] as soon as an entry answers the request and
    /// [`Flow::Continue`] when the chain ran to the end without a response.
    ///
    /// # Errors
    ///
    /// The first error returned by an entry; later entries do not run.
    pub async fn run(&self, req: &mut Request, res: &mut Response) -> Result<Flow, HttpError> {
        for entry in &self.entries {
            if !entry.covers(req.path()) {
                continue;
            }

            let saved = (!entry.is_root()).then(|| req.enter_mount(&entry.prefix));
            let outcome = entry.middleware.handle(req, res).await;
            if let Some(saved) = saved {
                req.leave_mount(saved);
            }

            match outcome? {
                Flow::Sent => return Ok(Flow::Sent),
                Flow::Continue if res.is_sent() => {
                    debug!(prefix = %entry.prefix, "middleware sent and continued; stopping chain");
                    return Ok(Flow::Sent);
                }
                Flow::Continue => {}
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, RawRequest};
    use serde_json::{Value, json};

    fn request(target: &str) -> Request {
        Request::new(RawRequest::new(Method::Get, target), false)
    }

    fn seen(req: &Request) -> Value {
        req.locals.get("seen").cloned().unwrap_or(json!([]))
    }

    // Records `step@path` in `req.locals["seen"]` and continues.
    struct Mark(&'static str);

    impl Middleware for Mark {
        fn handle<'a>(&'a self, req: &'a mut Request, _res: &'a mut Response) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async move {
                let step = format!("{}@{}", self.0, req.path());
                let entry = req.locals.entry("seen").or_insert_with(|| json!([]));
                if let Value::Array(items) = entry {
                    items.push(json!(step));
                }
                Ok(Flow::Continue)
            })
        }
    }

    fn mark(step: &'static str) -> Mark {
        Mark(step)
    }

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("api/"), "/api");
        assert_eq!(normalize_prefix("/api/v1/"), "/api/v1");
    }

    #[test]
    fn prefixes_match_whole_segments() {
        let entry = MiddlewareEntry {
            prefix: "/api".to_owned(),
            middleware: Box::new(Router::new()),
        };
        assert!(entry.covers("/api"));
        assert!(entry.covers("/api/users"));
        assert!(!entry.covers("/apiary"));
        assert!(!entry.covers("/"));
    }

    #[tokio::test]
    async fn runs_in_registration_order_with_relative_paths() {
        let mut stack = MiddlewareStack::new();
        stack.push("/", mark("root"));
        stack.push("/api", mark("api"));
        stack.push("/admin", mark("admin"));
        stack.push("/", mark("tail"));

        let mut req = request("/api/users");
        let mut res = Response::default();
        let flow = stack.run(&mut req, &mut res).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            seen(&req),
            json!(["root@/api/users", "api@/users", "tail@/api/users"])
        );
        assert_eq!(req.path(), "/api/users");
        assert_eq!(req.base_url(), "");
    }

    #[tokio::test]
    async fn short_circuit_stops_chain() {
        let mut stack = MiddlewareStack::new();
        stack.push(
            "/",
            FnMiddleware::new(|_req, res| {
                Box::pin(async move {
                    res.status(403).send("nope")?;
                    Ok(Flow::Sent)
                })
            }),
        );
        stack.push("/", mark("never"));

        let mut req = request("/");
        let mut res = Response::default();
        assert_eq!(stack.run(&mut req, &mut res).await.unwrap(), Flow::Sent);
        assert_eq!(res.body(), b"nope");
        assert!(req.locals.get("seen").is_none());
    }

    #[tokio::test]
    async fn error_stops_chain_and_restores_path() {
        let mut stack = MiddlewareStack::new();
        stack.push(
            "/api",
            FnMiddleware::new(|_req, _res| Box::pin(async move { Err(HttpError::msg("denied")) })),
        );
        stack.push("/", mark("never"));

        let mut req = request("/api/x");
        let mut res = Response::default();
        let err = stack.run(&mut req, &mut res).await.unwrap_err();
        assert_eq!(err.message(), "denied");
        assert_eq!(req.path(), "/api/x");
        assert!(req.locals.get("seen").is_none());
    }

    #[tokio::test]
    async fn mounted_router_sees_stripped_path() {
        let mut api = Router::new();
        api.get("/users/:id", |req, res| {
            Box::pin(async move {
                let reply = format!("{}{} id={}", req.base_url(), req.path(), req.param("id").unwrap_or_default());
                res.send(reply)?;
                Ok(Flow::Sent)
            })
        });

        let mut stack = MiddlewareStack::new();
        stack.push("/api", api);
        stack.push("/", mark("fallthrough"));

        let mut req = request("/api/users/9");
        let mut res = Response::default();
        assert_eq!(stack.run(&mut req, &mut res).await.unwrap(), Flow::Sent);
        assert_eq!(res.body(), b"/api/users/9 id=9");
        assert_eq!(req.param("id"), Some("9"));

        let mut req = request("/api/missing");
        let mut res = Response::default();
        assert_eq!(stack.run(&mut req, &mut res).await.unwrap(), Flow::Continue);
        assert_eq!(seen(&req), json!(["fallthrough@/api/missing"]));
    }
}
