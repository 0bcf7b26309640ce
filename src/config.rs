//! Client configuration.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use crate::handler::{ConnectionErrorHandler, DefaultConnectionErrorHandler};

/// Final per-request hook: receives the prepared request builder (URL,
/// method, headers, body, `Last-Event-ID` all set) and may return any
/// request derived from it.
pub type RequestTransformer =
    dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync;

/// Configuration for an [`EventSource`](crate::EventSource).
///
/// Provides sensible defaults and chainable setter methods; only the URL is
/// required. Validation happens when the client is constructed.
#[derive(Clone)]
pub struct ClientConfig {
    /// SSE endpoint URL (must be http or https).
    pub(crate) url: String,
    /// Instance label used in log output.
    pub(crate) name: String,
    /// HTTP method, uppercased (usually GET, some APIs use POST).
    pub(crate) method: String,
    /// Additional HTTP headers, merged over the stream defaults.
    pub(crate) headers: HeaderMap,
    /// Optional request body (for POST-based SSE).
    pub(crate) body: Option<Vec<u8>>,
    /// Final per-request mutator.
    pub(crate) request_transformer: Option<Arc<RequestTransformer>>,
    /// Seed for the `Last-Event-ID` header.
    pub(crate) last_event_id: Option<String>,
    /// Initial delay before a reconnection attempt.
    pub(crate) reconnect_time: Duration,
    /// Ceiling on reconnection delays.
    pub(crate) max_reconnect_time: Duration,
    /// How long a connection must stay open to reset the backoff.
    pub(crate) backoff_reset_threshold: Duration,
    /// Transport connect timeout.
    pub(crate) connect_timeout: Duration,
    /// Transport read timeout; a stream idle this long fails and reconnects.
    pub(crate) read_timeout: Duration,
    /// Initial capacity of the line buffer.
    pub(crate) read_buffer_size: usize,
    /// Deliver events as soon as `data` begins instead of buffering them.
    pub(crate) stream_event_data: bool,
    /// Fields that must precede `data` for streaming delivery; only
    /// `"event"` and `"id"` are meaningful.
    pub(crate) expect_fields: HashSet<String>,
    /// Bound on queued-or-running handler tasks; 0 means unbounded.
    pub(crate) max_event_tasks_in_flight: usize,
    /// Policy hook consulted on connection failures.
    pub(crate) connection_error_handler: Arc<dyn ConnectionErrorHandler>,
    /// Optional proxy for the HTTP client.
    pub(crate) proxy: Option<reqwest::Proxy>,
    /// Caller-supplied HTTP client; overrides the timeout/proxy options.
    pub(crate) http_client: Option<reqwest::Client>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            name: String::new(),
            method: "GET".to_string(),
            headers: HeaderMap::new(),
            body: None,
            request_transformer: None,
            last_event_id: None,
            reconnect_time: Duration::from_secs(1),
            max_reconnect_time: Duration::from_secs(30),
            backoff_reset_threshold: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            read_buffer_size: 1000,
            stream_event_data: false,
            expect_fields: HashSet::new(),
            max_event_tasks_in_flight: 0,
            connection_error_handler: Arc::new(DefaultConnectionErrorHandler),
            proxy: None,
            http_client: None,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with the given endpoint URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set an instance label, included in log output. Useful when one
    /// process runs several clients.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the HTTP method. Empty falls back to GET; the name is
    /// uppercased.
    #[must_use]
    pub fn method(mut self, method: impl AsRef<str>) -> Self {
        let method = method.as_ref();
        self.method = if method.is_empty() {
            "GET".to_string()
        } else {
            method.to_ascii_uppercase()
        };
        self
    }

    /// Set additional HTTP headers sent with every stream request. They
    /// override the `Accept` / `Cache-Control` defaults per header name.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body (for POST-based SSE).
    #[must_use]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Set a hook that can customize each outgoing request after all
    /// standard properties have been applied.
    #[must_use]
    pub fn request_transformer(
        mut self,
        transformer: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.request_transformer = Some(Arc::new(transformer));
        self
    }

    /// Seed the id sent as `Last-Event-ID` on the first request, letting
    /// the server resume where a previous process left off.
    #[must_use]
    pub fn last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }

    /// Set the initial reconnection delay. The server can move this with a
    /// `retry:` directive. Zero disables the delay entirely.
    #[must_use]
    pub fn reconnect_time(mut self, time: Duration) -> Self {
        self.reconnect_time = time;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn max_reconnect_time(mut self, time: Duration) -> Self {
        self.max_reconnect_time = time;
        self
    }

    /// Set how long a connection must stay open for the next failure to
    /// start over at the initial delay instead of continuing to grow.
    #[must_use]
    pub fn backoff_reset_threshold(mut self, threshold: Duration) -> Self {
        self.backoff_reset_threshold = threshold;
        self
    }

    /// Set the transport connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the transport read timeout. A timed-out read fails the
    /// connection and the client reconnects.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the initial capacity of the line buffer. Lines longer than this
    /// still work; they just grow the buffer temporarily.
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Deliver each event as soon as its first `data` field arrives,
    /// exposing the payload as a lazy [`DataReader`](crate::DataReader).
    /// See [`EventHandler`](crate::EventHandler) for the constraints.
    #[must_use]
    pub fn stream_event_data(mut self, enabled: bool) -> Self {
        self.stream_event_data = enabled;
        self
    }

    /// Declare fields the server always sends before `data`. In
    /// streaming-data mode, an event whose listed fields have not arrived
    /// yet is buffered instead, so they are not lost. Names other than
    /// `"event"` and `"id"` are ignored.
    #[must_use]
    pub fn expect_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expect_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Bound the number of queued-or-running handler tasks. When the bound
    /// is reached the stream worker blocks until the handler catches up.
    /// 0 (the default) means unbounded.
    #[must_use]
    pub fn max_event_tasks_in_flight(mut self, max: usize) -> Self {
        self.max_event_tasks_in_flight = max;
        self
    }

    /// Set the policy hook consulted on connection failures before the
    /// event handler hears about them.
    #[must_use]
    pub fn connection_error_handler(
        mut self,
        handler: impl ConnectionErrorHandler + 'static,
    ) -> Self {
        self.connection_error_handler = Arc::new(handler);
        self
    }

    /// Route stream requests through a proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: reqwest::Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Use a caller-built HTTP client instead of one derived from the
    /// timeout and proxy options.
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        let url = url::Url::parse(&self.url).map_err(|e| format!("invalid URL: {e}"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!("URL scheme must be http or https, got {}", url.scheme()));
        }
        if http::Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(format!("invalid HTTP method: {:?}", self.method));
        }
        if self.read_buffer_size == 0 {
            return Err("Read buffer size must be > 0".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("name", &self.name)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|b| b.len()))
            .field("request_transformer", &self.request_transformer.is_some())
            .field("last_event_id", &self.last_event_id)
            .field("reconnect_time", &self.reconnect_time)
            .field("max_reconnect_time", &self.max_reconnect_time)
            .field("backoff_reset_threshold", &self.backoff_reset_threshold)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("stream_event_data", &self.stream_event_data)
            .field("expect_fields", &self.expect_fields)
            .field("max_event_tasks_in_flight", &self.max_event_tasks_in_flight)
            .field("proxy", &self.proxy.is_some())
            .field("http_client", &self.http_client.is_some())
            .finish_non_exhaustive()
    }
}
