//! Request routing: map URL patterns and HTTP methods to handlers.
//!
//! A [`Router`] is an ordered list of layers, each binding a method filter
//! and a compiled [`PathMatcher`] to one handler. Registration order is the
//! only priority: dispatch walks the layers in order and invokes the first
//! one whose method and pattern both match. A handler ends dispatch by
//! returning [`Flow::Sent`], or passes the request on to the next matching
//! layer with [`Flow::Continue`].
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/archive/:year?`    | `/archive`                 | *(none)*                        |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "docs/readme.txt"`  |

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::HttpError;
use crate::http::{Method, Request, Response};

pub mod pattern;

pub use pattern::{PathMatcher, PatternError};

/// A boxed, `Send` future borrowing from the request it handles.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What handlers, validators and middleware return.
pub type HandlerResult = Result<Flow, HttpError>;

/// How a handler wants dispatch to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Pass the request to the next matching layer or middleware.
    Continue,
    /// The response has been written; stop.
    Sent,
}

/// The outcome of [`Router::dispatch`] when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler or validator answered the request.
    Handled,
    /// Every layer was tried and none answered.
    NotFound,
}

/// An async request handler.
///
/// Closures of the form `|req, res| Box::pin(async move { ... })` implement
/// this trait through the blanket impl. Implement it directly for handlers
/// that carry state.
///
/// # Examples
///
/// ```
/// use keel::router::{BoxFuture, Flow, Handler, HandlerResult};
/// use keel::{Request, Response};
///
/// struct Greeting(&'static str);
///
/// impl Handler for Greeting {
///     fn call<'a>(&'a self, _req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, HandlerResult> {
///         Box::pin(async move {
///             res.send(self.0)?;
///             Ok(Flow::Sent)
///         })
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, HandlerResult>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(&'a self, req: &'a mut Request, res: &'a mut Response) -> BoxFuture<'a, HandlerResult> {
        (self)(req, res)
    }
}

/// Boxes a closure as a shareable [`Handler`], for use with
/// [`Router::register`].
pub fn handler<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

type ParamValidator = Arc<
    dyn for<'a> Fn(&'a mut Request, &'a mut Response, String) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync,
>;

/// Which request methods a layer answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFilter {
    /// Every method.
    Any,
    Only(Method),
}

impl MethodFilter {
    fn allows(&self, method: &Method, head_falls_back: bool) -> bool {
        match self {
            Self::Any => true,
            Self::Only(m) => m == method || (head_falls_back && *m == Method::Get),
        }
    }
}

impl From<Method> for MethodFilter {
    fn from(method: Method) -> Self {
        Self::Only(method)
    }
}

impl fmt::Display for MethodFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Only(m) => f.write_str(m.as_str()),
        }
    }
}

// One registered handler bound to a method and a compiled pattern.
struct Layer {
    method: MethodFilter,
    matcher: PathMatcher,
    handler: Arc<dyn Handler>,
}

/// HTTP request router that dispatches requests to registered handlers.
///
/// # Examples
///
/// ```
/// use keel::{Flow, Router};
///
/// let mut router = Router::new();
///
/// router.get("/ping", |_req, res| Box::pin(async move {
///     res.send("pong")?;
///     Ok(Flow::Sent)
/// }));
///
/// router.get("/users/:id", |req, res| Box::pin(async move {
///     let id = req.param("id").unwrap_or("unknown").to_owned();
///     res.send(format!("user {id}"))?;
///     Ok(Flow::Sent)
/// }));
///
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default)]
pub struct Router {
    layers: Vec<Layer>,
    validators: HashMap<String, Vec<ParamValidator>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes().map(|(m, p)| format!("{m} {p}")).collect::<Vec<_>>())
            .field("validated_params", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handlers` for `method` and `pattern`, one layer per handler
    /// in the order given.
    ///
    /// # Errors
    ///
    /// Returns the [`PatternError`] when `pattern` does not compile; nothing
    /// is registered in that case.
    pub fn try_register(
        &mut self,
        method: impl Into<MethodFilter>,
        pattern: &str,
        handlers: impl IntoIterator<Item = Arc<dyn Handler>>,
    ) -> Result<&mut Self, PatternError> {
        let method = method.into();
        let matcher = PathMatcher::compile(pattern)?;
        for handler in handlers {
            trace!(method = %method, pattern, "route registered");
            self.layers.push(Layer {
                method: method.clone(),
                matcher: matcher.clone(),
                handler,
            });
        }
        Ok(self)
    }

    /// Like [`try_register`](Self::try_register).
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn register(
        &mut self,
        method: impl Into<MethodFilter>,
        pattern: &str,
        handlers: impl IntoIterator<Item = Arc<dyn Handler>>,
    ) -> &mut Self {
        match self.try_register(method, pattern, handlers) {
            Ok(this) => this,
            Err(e) => panic!("{e}"),
        }
    }

    /// Registers a single handler.
    ///
    /// # Errors
    ///
    /// See [`try_register`](Self::try_register).
    pub fn try_route<F>(
        &mut self,
        method: impl Into<MethodFilter>,
        pattern: &str,
        handler: F,
    ) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.try_register(method, pattern, [self::handler(handler)])
    }

    /// Registers a single handler.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn route<F>(&mut self, method: impl Into<MethodFilter>, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.register(method, pattern, [self::handler(handler)])
    }

    /// Register a handler for `GET` requests matching `pattern`. `HEAD`
    /// requests fall back to it when no `HEAD` route matches.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn get<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(Method::Get, pattern, handler)
    }

    /// Register a handler for `POST` requests matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn post<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(Method::Post, pattern, handler)
    }

    /// Register a handler for `PUT` requests matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn put<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(Method::Put, pattern, handler)
    }

    /// Register a handler for `DELETE` requests matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(Method::Delete, pattern, handler)
    }

    /// Register a handler for `PATCH` requests matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn patch<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(Method::Patch, pattern, handler)
    }

    /// Register a handler for `OPTIONS` requests matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn options<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(Method::Options, pattern, handler)
    }

    /// Register a handler for `HEAD` requests matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn head<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(Method::Head, pattern, handler)
    }

    /// Register a handler for every method on `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is invalid.
    pub fn all<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.route(MethodFilter::Any, pattern, handler)
    }

    /// Registers a validator for the route parameter `name`.
    ///
    /// Whenever a matched layer captured `name`, its validators run before
    /// the layer's handler, in the order the pattern declares its keys. Each
    /// receives the decoded value and runs at most once per value per
    /// request. Returning [`Flow::Sent`] ends dispatch; an error aborts it.
    ///
    /// # Examples
    ///
    /// ```
    /// use keel::{Flow, HttpError, Router};
    ///
    /// let mut router = Router::new();
    /// router.on_param("id", |_req, _res, id| Box::pin(async move {
    ///     if id.parse::<u64>().is_err() {
    ///         return Err(HttpError::new(400, format!("invalid id {id:?}")));
    ///     }
    ///     Ok(Flow::Continue)
    /// }));
    /// ```
    pub fn on_param<F>(&mut self, name: &str, validator: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response, String) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.validators
            .entry(name.to_owned())
            .or_default()
            .push(Arc::new(validator));
        self
    }

    /// Return the number of layers registered in this router.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Registered `(method, pattern)` pairs in dispatch order.
    pub fn routes(&self) -> impl Iterator<Item = (&MethodFilter, &str)> {
        self.layers.iter().map(|l| (&l.method, l.matcher.pattern()))
    }

    /// Dispatches the request to the first matching layer.
    ///
    /// Params captured by each matching layer are merged into the request
    /// before its validators and handler run. A `HEAD` request is offered to
    /// `GET` layers unless a `HEAD` layer matches its path.
    ///
    /// # Errors
    ///
    /// The first error returned by a validator or handler. No further
    /// layers are tried after an error.
    pub async fn dispatch(&self, req: &mut Request, res: &mut Response) -> Result<Dispatch, HttpError> {
        let method = req.method().clone();
        let head_falls_back = method == Method::Head
            && !self.layers.iter().any(|l| {
                l.method == MethodFilter::Only(Method::Head) && l.matcher.is_match(req.path())
            });
        let mut validated: HashSet<(String, String)> = HashSet::new();

        for layer in &self.layers {
            if !layer.method.allows(&method, head_falls_back) {
                continue;
            }
            let Some(params) = layer.matcher.matches(req.path()) else {
                continue;
            };
            trace!(pattern = layer.matcher.pattern(), path = req.path(), "layer matched");

            let pending: Vec<(String, String)> = layer
                .matcher
                .keys()
                .iter()
                .filter(|key| self.validators.contains_key(key.as_str()))
                .filter_map(|key| params.get(key).map(|value| (key.clone(), value.to_owned())))
                .collect();
            req.merge_params(params);

            for (key, value) in pending {
                if !validated.insert((key.clone(), value.clone())) {
                    continue;
                }
                for validator in self.validators.get(&key).into_iter().flatten() {
                    if validator(req, res, value.clone()).await? == Flow::Sent {
                        return Ok(Dispatch::Handled);
                    }
                }
            }

            match layer.handler.call(req, res).await? {
                Flow::Sent => return Ok(Dispatch::Handled),
                Flow::Continue if res.is_sent() => {
                    debug!(pattern = layer.matcher.pattern(), "handler sent and continued; stopping");
                    return Ok(Dispatch::Handled);
                }
                Flow::Continue => {}
            }
        }

        Ok(Dispatch::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RawRequest;
    use serde_json::{Value, json};

    fn request(method: Method, target: &str) -> Request {
        Request::new(RawRequest::new(method, target), false)
    }

    async fn run(router: &Router, method: Method, target: &str) -> (Result<Dispatch, HttpError>, Response) {
        let mut req = request(method, target);
        let mut res = Response::default();
        let outcome = router.dispatch(&mut req, &mut res).await;
        (outcome, res)
    }

    fn body(res: &Response) -> String {
        String::from_utf8(res.body().to_vec()).unwrap()
    }

    fn reply(text: &'static str) -> Arc<dyn Handler> {
        handler(move |_req, res| {
            Box::pin(async move {
                res.send(text)?;
                Ok(Flow::Sent)
            })
        })
    }

    fn record(step: &'static str) -> Arc<dyn Handler> {
        handler(move |req, _res| {
            Box::pin(async move {
                let seen = req.locals.entry("seen").or_insert_with(|| json!([]));
                if let Value::Array(items) = seen {
                    items.push(json!(step));
                }
                Ok(Flow::Continue)
            })
        })
    }

    fn send_seen() -> Arc<dyn Handler> {
        handler(|req, res| {
            Box::pin(async move {
                let seen = req.locals.get("seen").cloned().unwrap_or(Value::Null);
                res.send(seen)?;
                Ok(Flow::Sent)
            })
        })
    }

    #[test]
    fn router_starts_empty() {
        let router = Router::new();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[tokio::test]
    async fn empty_router_is_not_found() {
        let (outcome, res) = run(&Router::new(), Method::Get, "/").await;
        assert_eq!(outcome.unwrap(), Dispatch::NotFound);
        assert!(!res.is_sent());
    }

    #[tokio::test]
    async fn first_matching_layer_wins() {
        let mut router = Router::new();
        router.register(Method::Get, "/path", [reply("first")]);
        router.register(Method::Get, "/path", [reply("second")]);
        router.register(Method::Get, "/:any", [reply("param")]);

        let (outcome, res) = run(&router, Method::Get, "/path").await;
        assert_eq!(outcome.unwrap(), Dispatch::Handled);
        assert_eq!(body(&res), "first");
    }

    #[tokio::test]
    async fn method_mismatch_is_skipped() {
        let mut router = Router::new();
        router.register(Method::Post, "/thing", [reply("post")]);
        router.register(Method::Get, "/thing", [reply("get")]);

        let (_, res) = run(&router, Method::Get, "/thing").await;
        assert_eq!(body(&res), "get");
        let (outcome, _) = run(&router, Method::Put, "/thing").await;
        assert_eq!(outcome.unwrap(), Dispatch::NotFound);
    }

    #[tokio::test]
    async fn all_matches_any_method() {
        let mut router = Router::new();
        router.register(MethodFilter::Any, "/any", [reply("any")]);
        for method in [Method::Get, Method::Delete, Method::Custom("PURGE".into())] {
            let (_, res) = run(&router, method, "/any").await;
            assert_eq!(body(&res), "any");
        }
    }

    #[tokio::test]
    async fn continue_runs_handlers_in_sequence() {
        let mut router = Router::new();
        router.register(Method::Get, "/chain", [record("a"), record("b")]);
        router.register(Method::Get, "/:x", [record("c"), send_seen()]);

        let (outcome, res) = run(&router, Method::Get, "/chain").await;
        assert_eq!(outcome.unwrap(), Dispatch::Handled);
        assert_eq!(body(&res), r#"["a","b","c"]"#);
    }

    #[tokio::test]
    async fn continuing_past_every_layer_is_not_found() {
        let mut router = Router::new();
        router.register(Method::Get, "/x", [record("a")]);
        let (outcome, _) = run(&router, Method::Get, "/x").await;
        assert_eq!(outcome.unwrap(), Dispatch::NotFound);
    }

    #[tokio::test]
    async fn error_aborts_traversal() {
        let mut router = Router::new();
        router.get("/fail", |_req, _res| Box::pin(async move { Err(HttpError::msg("boom")) }));
        router.register(Method::Get, "/fail", [reply("unreachable")]);

        let (outcome, res) = run(&router, Method::Get, "/fail").await;
        assert_eq!(outcome.unwrap_err().message(), "boom");
        assert!(!res.is_sent());
    }

    #[tokio::test]
    async fn params_are_merged_into_request() {
        let mut router = Router::new();
        router.get("/users/:id/:tab?", |req, res| {
            Box::pin(async move {
                let tab = req.param("tab").unwrap_or("<none>").to_owned();
                res.send(format!("{}:{tab}", req.param("id").unwrap_or_default()))?;
                Ok(Flow::Sent)
            })
        });

        let (_, res) = run(&router, Method::Get, "/users/42/posts").await;
        assert_eq!(body(&res), "42:posts");
        let (_, res) = run(&router, Method::Get, "/users/42").await;
        assert_eq!(body(&res), "42:<none>");
    }

    #[tokio::test]
    async fn params_accumulate_across_layers() {
        let mut router = Router::new();
        router.register(Method::Get, "/:org/*", [record("outer")]);
        router.get("/:org/repos/:repo", |req, res| {
            Box::pin(async move {
                let params: Vec<String> = req.params().iter().map(|(k, v)| format!("{k}={v}")).collect();
                res.send(params.join("&"))?;
                Ok(Flow::Sent)
            })
        });

        let (_, res) = run(&router, Method::Get, "/acme/repos/keel").await;
        assert_eq!(body(&res), "org=acme&wildcard=repos/keel&repo=keel");
    }

    #[tokio::test]
    async fn head_falls_back_to_get() {
        let mut router = Router::new();
        router.register(Method::Get, "/page", [reply("get")]);
        let (outcome, res) = run(&router, Method::Head, "/page").await;
        assert_eq!(outcome.unwrap(), Dispatch::Handled);
        assert_eq!(body(&res), "get");

        router.register(Method::Head, "/page", [reply("head")]);
        let (_, res) = run(&router, Method::Head, "/page").await;
        assert_eq!(body(&res), "head");
    }

    #[tokio::test]
    async fn validators_run_in_key_order_before_handler() {
        let mut router = Router::new();
        for name in ["b", "a"] {
            router.on_param(name, move |req, _res, value| {
                Box::pin(async move {
                    let seen = req.locals.entry("seen").or_insert_with(|| json!([]));
                    if let Value::Array(items) = seen {
                        items.push(json!(format!("{name}={value}")));
                    }
                    Ok(Flow::Continue)
                })
            });
        }
        router.register(Method::Get, "/:a/:b", [record("handler"), send_seen()]);

        let (_, res) = run(&router, Method::Get, "/1/2").await;
        assert_eq!(body(&res), r#"["a=1","b=2","handler"]"#);
    }

    #[tokio::test]
    async fn validator_can_answer_or_fail() {
        let mut router = Router::new();
        router.on_param("id", |_req, res, id| {
            Box::pin(async move {
                match id.as_str() {
                    "me" => {
                        res.redirect("/profile")?;
                        Ok(Flow::Sent)
                    }
                    id if id.parse::<u32>().is_err() => {
                        Err(HttpError::new(400, format!("bad id {id}")))
                    }
                    _ => Ok(Flow::Continue),
                }
            })
        });
        router.register(Method::Get, "/users/:id", [reply("user")]);

        let (_, res) = run(&router, Method::Get, "/users/7").await;
        assert_eq!(body(&res), "user");

        let (outcome, res) = run(&router, Method::Get, "/users/me").await;
        assert_eq!(outcome.unwrap(), Dispatch::Handled);
        assert_eq!(res.get_header("location"), Some("/profile"));

        let (outcome, _) = run(&router, Method::Get, "/users/x").await;
        assert_eq!(outcome.unwrap_err().status().as_u16(), 400);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut router = Router::new();
        assert!(router.try_register(Method::Get, "/:", [reply("x")]).is_err());
        assert!(router.is_empty());
    }

    #[test]
    #[should_panic(expected = "declares parameter")]
    fn route_panics_on_invalid_pattern() {
        Router::new().register(Method::Get, "/:id/:id", [reply("x")]);
    }

    #[test]
    fn routes_lists_layers_in_order() {
        let mut router = Router::new();
        router.register(Method::Get, "/a", [reply("a")]);
        router.register(MethodFilter::Any, "/b", [reply("b")]);
        let listed: Vec<String> = router.routes().map(|(m, p)| format!("{m} {p}")).collect();
        assert_eq!(listed, ["GET /a", "* /b"]);
    }
}
