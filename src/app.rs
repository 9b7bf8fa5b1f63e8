//! The application: registration, the per-request lifecycle, and startup.
//!
//! An [`App`] is configured by value: routes, middleware, mounted routers
//! and the error hook are registered through `&mut self`. Starting it
//! ([`App::bind`], [`App::listen`]) moves it behind an `Arc`, after which it
//! is shared read-only by every connection.
//!
//! Each request moves through a fixed sequence:
//!
//! 1. cookies are parsed;
//! 2. for POST, PUT, PATCH and DELETE the body is parsed (failures leave an
//!    empty object);
//! 3. middleware covering the path run in registration order;
//! 4. if nothing was sent, the application router dispatches;
//! 5. no match, or any error along the way, goes to the error hook and then
//!    the [`ErrorHandler`].

use std::sync::Arc;

use tokio::time::Instant;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{ErrorHandler, HttpError};
use crate::http::{Method, RawRequest, Request, Response};
use crate::middleware::{FnMiddleware, Middleware, MiddlewareStack};
use crate::router::{BoxFuture, Dispatch, Flow, Handler, HandlerResult, MethodFilter, PatternError, Router};
use crate::server::{ListenOptions, Server, ServerError, TlsConfig};
use crate::view::Views;

type ErrorHook = Box<
    dyn for<'a> Fn(&'a HttpError, &'a mut Request, &'a mut Response) -> BoxFuture<'a, ()>
        + Send
        + Sync,
>;

/// An HTTP application.
///
/// # Examples
///
/// ```rust,no_run
/// use keel::{App, Flow};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), keel::ServerError> {
///     let mut app = App::new();
///
///     app.use_fn("/", |_req, res| Box::pin(async move {
///         res.header("X-Powered-By", "keel");
///         Ok(Flow::Continue)
///     }));
///
///     app.get("/hello/:name", |req, res| Box::pin(async move {
///         res.json(&json!({ "hello": req.param("name") }))?;
///         Ok(Flow::Sent)
///     }));
///
///     app.listen("127.0.0.1:3000").await
/// }
/// ```
pub struct App {
    config: AppConfig,
    views: Arc<Views>,
    middleware: MiddlewareStack,
    router: Router,
    error_handler: ErrorHandler,
    error_hook: Option<ErrorHook>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("middleware", &self.middleware)
            .field("router", &self.router)
            .field("error_hook", &self.error_hook.is_some())
            .finish_non_exhaustive()
    }
}

impl App {
    /// Creates an application with [`AppConfig::default`] (development mode).
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self {
            views: Arc::new(Views::from_config(&config)),
            error_handler: ErrorHandler::new(config.env),
            config,
            middleware: MiddlewareStack::new(),
            router: Router::new(),
            error_hook: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Replaces the view renderer built from the configuration.
    pub fn set_views(&mut self, views: Views) -> &mut Self {
        self.views = Arc::new(views);
        self
    }

    pub fn views(&self) -> &Views {
        &self.views
    }

    /// The application-level router, which runs after all middleware.
    pub fn router(&self) -> &Router {
        &self.router
    }

    // ── Middleware ──────────────────────────────────────────────────────────

    /// Adds `middleware` to the chain for requests under `prefix`.
    pub fn use_middleware(&mut self, prefix: &str, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(prefix, middleware);
        self
    }

    /// Adds a closure to the chain for requests under `prefix`.
    pub fn use_fn<F>(&mut self, prefix: &str, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.use_middleware(prefix, FnMiddleware::new(f))
    }

    /// Mounts `router` under `prefix`. It takes its place in the middleware
    /// chain; requests it does not match continue down the chain.
    pub fn mount(&mut self, prefix: &str, router: Router) -> &mut Self {
        self.use_middleware(prefix, router)
    }

    /// Registration entry point for extensions: same as
    /// [`use_middleware`](Self::use_middleware).
    pub fn add_middleware(&mut self, prefix: &str, middleware: impl Middleware) -> &mut Self {
        self.use_middleware(prefix, middleware)
    }

    /// Registration entry point for extensions that build handlers as
    /// trait objects.
    ///
    /// # Errors
    ///
    /// Returns the [`PatternError`] for an invalid pattern.
    pub fn add_route(
        &mut self,
        method: impl Into<MethodFilter>,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<&mut Self, PatternError> {
        self.router.try_register(method, pattern, [handler])?;
        Ok(self)
    }

    /// Installs a hook that sees every error before the default handler.
    /// If the hook sends a response, the default handler does nothing.
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a HttpError, &'a mut Request, &'a mut Response) -> BoxFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    {
        self.error_hook = Some(Box::new(hook));
        self
    }

    // ── Routes ──────────────────────────────────────────────────────────────

    /// See [`Router::try_register`].
    ///
    /// # Errors
    ///
    /// Returns the [`PatternError`] for an invalid pattern.
    pub fn try_register(
        &mut self,
        method: impl Into<MethodFilter>,
        pattern: &str,
        handlers: impl IntoIterator<Item = Arc<dyn Handler>>,
    ) -> Result<&mut Self, PatternError> {
        self.router.try_register(method, pattern, handlers)?;
        Ok(self)
    }

    /// See [`Router::register`].
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
        self.router.register(method, pattern, handlers);
        self
    }

    /// See [`Router::try_route`].
    ///
    /// # Errors
    ///
    /// Returns the [`PatternError`] for an invalid pattern.
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
        self.router.try_route(method, pattern, handler)?;
        Ok(self)
    }

    /// See [`Router::route`].
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
        self.router.route(method, pattern, handler);
        self
    }

    /// See [`Router::on_param`].
    pub fn on_param<F>(&mut self, name: &str, validator: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response, String) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.router.on_param(name, validator);
        self
    }
}

macro_rules! method_routes {
    ($($(#[$doc:meta])* $name:ident => $filter:expr;)+) => {
        impl App {
            $(
                $(#[$doc])*
                ///
                /// # Panics
                ///
                /// Panics if `pattern` is invalid.
                pub fn $name<F>(&mut self, pattern: &str, handler: F) -> &mut Self
                where
                    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
                        + Send
                        + Sync
                        + 'static,
                {
                    self.router.route($filter, pattern, handler);
                    self
                }
            )+
        }
    };
}

method_routes! {
    /// Routes `GET` (and unmatched `HEAD`) requests.
    get => Method::Get;
    /// Routes `POST` requests.
    post => Method::Post;
    /// Routes `PUT` requests.
    put => Method::Put;
    /// Routes `DELETE` requests.
    delete => Method::Delete;
    /// Routes `PATCH` requests.
    patch => Method::Patch;
    /// Routes `OPTIONS` requests.
    options => Method::Options;
    /// Routes `HEAD` requests.
    head => Method::Head;
    /// Routes every method.
    all => MethodFilter::Any;
}

impl App {
    /// Runs one request through the full lifecycle and returns the response
    /// to write. Never fails: every error becomes an error response.
    pub async fn handle(&self, raw: RawRequest) -> Response {
        let start = Instant::now();

        let mut res = Response::new(Arc::clone(&self.views));
        res.set_head_only(raw.method == Method::Head);
        res.set_keep_alive(raw.is_keep_alive());
        let mut req = Request::new(raw, self.config.trust_proxy);

        let outcome = match self.config.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.process(&mut req, &mut res))
                .await
                .unwrap_or_else(|_| Err(HttpError::timeout())),
            None => self.process(&mut req, &mut res).await,
        };

        if let Err(err) = outcome {
            self.handle_error(&err, &mut req, &mut res).await;
        }

        info!(
            method = %req.method(),
            path = req.original_url(),
            status = res.status_code().as_u16(),
            elapsed = ?start.elapsed(),
            "request completed"
        );
        res
    }

    async fn process(&self, req: &mut Request, res: &mut Response) -> Result<(), HttpError> {
        req.parse_cookies();
        if req.method().carries_body() {
            req.parse_body().await;
        }

        if self.middleware.run(req, res).await? == Flow::Continue
            && self.router.dispatch(req, res).await? == Dispatch::NotFound
        {
            return Err(HttpError::not_found(req.method().as_str(), req.path()));
        }

        if !res.is_sent() {
            return Err(HttpError::msg("request was reported handled but no response was sent"));
        }
        Ok(())
    }

    async fn handle_error(&self, err: &HttpError, req: &mut Request, res: &mut Response) {
        if let Some(hook) = &self.error_hook {
            hook(err, req, res).await;
        }
        self.error_handler.handle(err, req, res).await;
    }

    // ── Startup ─────────────────────────────────────────────────────────────

    /// Binds a listener for this application. The returned [`Server`]
    /// reports its address through [`Server::local_addr`] and starts
    /// serving on [`Server::run`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if the address cannot be resolved or bound.
    pub async fn bind(self, options: ListenOptions) -> Result<Server, ServerError> {
        Server::bind(Arc::new(self), &options, None).await
    }

    /// Like [`bind`](Self::bind), serving HTTPS with the given certificate.
    ///
    /// # Errors
    ///
    /// Also returns [`ServerError`] if the certificate or key cannot be loaded.
    pub async fn bind_tls(self, options: ListenOptions, tls: TlsConfig) -> Result<Server, ServerError> {
        let acceptor = tls.acceptor()?;
        Server::bind(Arc::new(self), &options, Some(acceptor)).await
    }

    /// Binds `addr` (`"host:port"`) and serves until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if binding fails or the listener dies.
    pub async fn listen(self, addr: &str) -> Result<(), ServerError> {
        let options = ListenOptions::parse(addr)?;
        self.bind(options).await?.run().await
    }
}
