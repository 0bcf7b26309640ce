//! The SSE client: ready-state machine, stream worker, and reconnect loop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use bytes_utils::Str;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{ACCEPT, CACHE_CONTROL, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::config::{ClientConfig, RequestTransformer};
use crate::dispatch::AsyncDispatcher;
use crate::error::{ClientError, Result};
use crate::handler::{ConnectionErrorHandler, ErrorAction, EventHandler};
use crate::parse::constants::EMPTY_STR;
use crate::parse::event_parser::{EventParser, ParserOptions, StreamDirectives};
use crate::parse::line_source::LineSource;
use crate::reconnect::BackoffPolicy;

const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// Lifecycle phase of an [`EventSource`], observable from any thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Never started.
    Raw = 0,
    /// A connection attempt is in progress.
    Connecting = 1,
    /// An event stream is established.
    Open = 2,
    /// Inactive between attempts.
    Closed = 3,
    /// Permanently shut down.
    Shutdown = 4,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Raw,
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closed,
            _ => Self::Shutdown,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "RAW",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding a [`ReadyState`].
///
/// All transitions go through compare-and-set so that `Shutdown` is
/// terminal: no racing worker can move the state away from it.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn compare_and_set(&self, from: ReadyState, to: ReadyState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn swap(&self, to: ReadyState) -> ReadyState {
        ReadyState::from_u8(self.0.swap(to as u8, Ordering::SeqCst))
    }

    /// Applies `f` atomically; returns the previous state.
    fn update(&self, f: impl Fn(ReadyState) -> ReadyState) -> ReadyState {
        let mut current = self.load();
        loop {
            let next = f(current);
            match self.0.compare_exchange(
                current as u8,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current,
                Err(observed) => current = ReadyState::from_u8(observed),
            }
        }
    }
}

/// State shared between the caller-facing surface, the stream worker, and
/// the parser's directive callbacks.
struct Shared {
    state: StateCell,
    reconnect_time_ms: AtomicU64,
    last_event_id: RwLock<Option<String>>,
    /// Cancels the in-flight attempt (sleep, connect, or read). A fresh
    /// token is published at the start of every worker iteration.
    call_token: Mutex<CancellationToken>,
}

impl Shared {
    fn reconnect_time(&self) -> Duration {
        Duration::from_millis(self.reconnect_time_ms.load(Ordering::SeqCst))
    }

    fn last_event_id_snapshot(&self) -> Option<String> {
        self.last_event_id.read().clone()
    }

    fn cancel_call(&self) {
        self.call_token.lock().cancel();
    }
}

impl StreamDirectives for Shared {
    fn set_reconnect_time(&self, time: Duration) {
        let millis = u64::try_from(time.as_millis()).unwrap_or(u64::MAX);
        self.reconnect_time_ms.store(millis, Ordering::SeqCst);
    }

    fn set_last_event_id(&self, id: &str) {
        *self.last_event_id.write() = if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        };
    }
}

/// A client for the Server-Sent Events protocol.
///
/// Configure with [`ClientConfig`] and construct with
/// [`EventSource::new`]; nothing connects until [`start()`](Self::start).
/// The client then keeps a stream alive on its own: it reconnects with
/// jittered exponential backoff, resumes with `Last-Event-ID`, and honors
/// server `retry:` directives. Unlike a browser `EventSource`, it retries
/// error classes a browser would give up on; the
/// [`ConnectionErrorHandler`] decides when to stop.
///
/// Dropping the client shuts it down.
pub struct EventSource {
    core: Arc<Core>,
    stream_worker: Mutex<Option<JoinHandle<()>>>,
}

struct Core {
    shared: Arc<Shared>,
    dispatcher: Arc<AsyncDispatcher>,
    error_handler: Arc<dyn ConnectionErrorHandler>,
    policy: BackoffPolicy,
    http: reqwest::Client,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    request_transformer: Option<Arc<RequestTransformer>>,
    origin: Arc<Url>,
    name: String,
    read_buffer_size: usize,
    stream_event_data: bool,
    expect_event: bool,
    expect_id: bool,
}

impl EventSource {
    /// Validates the configuration and builds an inactive client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the configuration is invalid or
    /// the HTTP client cannot be built.
    pub fn new(config: ClientConfig, handler: impl EventHandler + 'static) -> Result<Self> {
        config.validate().map_err(ClientError::config)?;

        let url = Url::parse(&config.url).map_err(|e| ClientError::config(e.to_string()))?;
        let method = Method::from_bytes(config.method.as_bytes())
            .map_err(|e| ClientError::config(e.to_string()))?;

        let http = match &config.http_client {
            Some(client) => client.clone(),
            None => {
                let mut builder = reqwest::Client::builder()
                    .connect_timeout(config.connect_timeout)
                    .read_timeout(config.read_timeout)
                    .pool_max_idle_per_host(1)
                    .pool_idle_timeout(Duration::from_secs(1));
                if let Some(proxy) = config.proxy.clone() {
                    builder = builder.proxy(proxy);
                }
                builder
                    .build()
                    .map_err(|e| ClientError::config(format!("failed to build HTTP client: {e}")))?
            }
        };

        let shared = Arc::new(Shared {
            state: StateCell::new(ReadyState::Raw),
            reconnect_time_ms: AtomicU64::new(
                u64::try_from(config.reconnect_time.as_millis()).unwrap_or(u64::MAX),
            ),
            last_event_id: RwLock::new(config.last_event_id.clone().filter(|id| !id.is_empty())),
            call_token: Mutex::new(CancellationToken::new()),
        });

        let dispatcher = Arc::new(AsyncDispatcher::new(
            Arc::new(handler),
            config.max_event_tasks_in_flight,
        ));

        let core = Core {
            shared,
            dispatcher,
            error_handler: Arc::clone(&config.connection_error_handler),
            policy: BackoffPolicy {
                max_delay: config.max_reconnect_time,
                reset_threshold: config.backoff_reset_threshold,
            },
            http,
            method,
            headers: merged_headers(&config.headers),
            body: config.body.clone().map(Bytes::from),
            request_transformer: config.request_transformer.clone(),
            origin: Arc::new(url),
            name: config.name.clone(),
            read_buffer_size: config.read_buffer_size,
            stream_event_data: config.stream_event_data,
            expect_event: config.expect_fields.contains("event"),
            expect_id: config.expect_fields.contains("id"),
        };

        Ok(Self {
            core: Arc::new(core),
            stream_worker: Mutex::new(None),
        })
    }

    /// Connects if never started. Returns immediately; the connection is
    /// made by a background worker. A no-op in any state but
    /// [`ReadyState::Raw`].
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self) {
        if !self
            .core
            .shared
            .state
            .compare_and_set(ReadyState::Raw, ReadyState::Connecting)
        {
            info!("start() called on an already-started client; doing nothing");
            return;
        }
        debug!(from = %ReadyState::Raw, to = %ReadyState::Connecting, "ready state change");
        info!(url = %self.core.origin, "starting SSE client");

        self.core.dispatcher.spawn_worker();
        let core = Arc::clone(&self.core);
        let span = info_span!("sse-stream", name = %self.core.name);
        *self.stream_worker.lock() = Some(tokio::spawn(
            async move { core.run_stream_worker().await }.instrument(span),
        ));
    }

    /// Drops the current stream (if open) and reconnects with the usual
    /// backoff semantics. Never started is the same as [`start()`](Self::start);
    /// connecting, closed, or shut down is a no-op. Non-blocking.
    pub fn restart(&self) {
        let previous = self.core.shared.state.update(|state| {
            if state == ReadyState::Open {
                ReadyState::Closed
            } else {
                state
            }
        });
        match previous {
            ReadyState::Open => {
                debug!(from = %ReadyState::Open, to = %ReadyState::Closed, "ready state change");
                self.core.drop_current_stream(previous);
            }
            ReadyState::Raw => self.start(),
            _ => {}
        }
    }

    /// Drops the current stream (if any) and permanently shuts the client
    /// down. Idempotent and non-blocking.
    pub fn close(&self) {
        self.core.close();
    }

    /// Blocks until both workers have terminated or the timeout passes;
    /// `true` means everything shut down in time.
    pub async fn await_closed(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        if !self.core.dispatcher.join_worker(deadline).await {
            return false;
        }

        let handle = self.stream_worker.lock().take();
        let Some(mut handle) = handle else {
            return true;
        };
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                *self.stream_worker.lock() = Some(handle);
                false
            }
        }
    }

    /// The current lifecycle phase.
    pub fn state(&self) -> ReadyState {
        self.core.shared.state.load()
    }

    /// The id of the last event received, or the configured seed before
    /// any event with an id arrived.
    pub fn last_event_id(&self) -> Option<String> {
        self.core.shared.last_event_id_snapshot()
    }

    /// The stream endpoint.
    pub fn url(&self) -> &Url {
        &self.core.origin
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("url", &self.core.origin.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Core {
    fn close(&self) {
        let previous = self.shared.state.swap(ReadyState::Shutdown);
        if previous == ReadyState::Shutdown {
            return;
        }
        debug!(from = %previous, to = %ReadyState::Shutdown, "ready state change");
        self.drop_current_stream(previous);
        self.dispatcher.shutdown();
    }

    fn drop_current_stream(&self, previous: ReadyState) {
        if previous == ReadyState::Open {
            self.dispatcher.submit_closed();
        }
        self.shared.cancel_call();
        debug!("stream connection cancelled");
    }

    async fn run_stream_worker(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        let mut connected_at: Option<Instant> = None;

        loop {
            if self.shared.state.load() == ReadyState::Shutdown {
                break;
            }
            // Publish the cancellation handle for this iteration before
            // re-checking state, so close() can never miss it.
            let token = CancellationToken::new();
            *self.shared.call_token.lock() = token.clone();
            if self.shared.state.load() == ReadyState::Shutdown {
                break;
            }

            if attempts == 0 {
                attempts = 1;
            } else {
                attempts = self.reconnect_delay(attempts, connected_at, &token).await;
            }
            self.connection_attempt(&mut connected_at, &token).await;
        }
        debug!("stream worker exiting");
    }

    /// Sleeps out the backoff; returns the attempt counter to carry into
    /// the next iteration. A zero reconnect time skips the delay without
    /// advancing the counter.
    async fn reconnect_delay(
        &self,
        attempts: u32,
        connected_at: Option<Instant>,
        token: &CancellationToken,
    ) -> u32 {
        let initial = self.shared.reconnect_time();
        if initial.is_zero() {
            return attempts;
        }

        let counter = self.policy.reset_attempts(attempts, connected_at);
        let delay = self.policy.delay(initial, counter);
        info!(delay_ms = delay.as_millis() as u64, "waiting before reconnecting");
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        counter + 1
    }

    async fn connection_attempt(
        &self,
        connected_at: &mut Option<Instant>,
        token: &CancellationToken,
    ) {
        let before = self.shared.state.update(|state| {
            if state == ReadyState::Shutdown {
                state
            } else {
                ReadyState::Connecting
            }
        });
        if before == ReadyState::Shutdown {
            return;
        }
        debug!(from = %before, to = %ReadyState::Connecting, "ready state change");
        *connected_at = None;

        let mut action = ErrorAction::Proceed;
        match self.attempt_stream(connected_at, token).await {
            Ok(()) => {
                // The server ended the stream (or the call was cancelled
                // from elsewhere, in which case the state says so). No
                // handler onError here; the error policy still gets a say.
                let state = self.shared.state.load();
                if state != ReadyState::Shutdown && state != ReadyState::Closed {
                    warn!("connection unexpectedly closed");
                    action = self
                        .error_handler
                        .on_connection_error(&ClientError::EndOfStream);
                }
            }
            Err(error @ ClientError::UnsuccessfulResponse { .. }) => {
                debug!(error = %error, "unsuccessful response");
                action = self.dispatch_error(error);
            }
            Err(error) => {
                let state = self.shared.state.load();
                if state != ReadyState::Shutdown && state != ReadyState::Closed {
                    debug!(error = %error, "connection problem");
                    action = self.dispatch_error(error);
                }
            }
        }

        if action == ErrorAction::Shutdown {
            info!("connection has been explicitly shut down by error handler");
            self.close();
        } else if self
            .shared
            .state
            .compare_and_set(ReadyState::Open, ReadyState::Closed)
        {
            debug!(from = %ReadyState::Open, to = %ReadyState::Closed, "ready state change");
            self.dispatcher.submit_closed();
        } else if self
            .shared
            .state
            .compare_and_set(ReadyState::Connecting, ReadyState::Closed)
        {
            debug!(from = %ReadyState::Connecting, to = %ReadyState::Closed, "ready state change");
        }
    }

    /// One connection: send the request, validate the status, run the
    /// parser over the body until it ends.
    ///
    /// `Ok(())` means the stream ended cleanly or the call was cancelled;
    /// the caller distinguishes the two by state.
    async fn attempt_stream(
        &self,
        connected_at: &mut Option<Instant>,
        token: &CancellationToken,
    ) -> Result<()> {
        let request = self.build_request();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::UnsuccessfulResponse { status });
        }

        *connected_at = Some(Instant::now());
        let previous = self.shared.state.update(|state| {
            if state == ReadyState::Shutdown {
                state
            } else {
                ReadyState::Open
            }
        });
        if previous == ReadyState::Shutdown {
            return Ok(());
        }
        if previous == ReadyState::Connecting {
            debug!(from = %previous, to = %ReadyState::Open, "ready state change");
        } else {
            warn!(from = %previous, to = %ReadyState::Open, "unexpected ready state change");
        }
        info!(url = %self.origin, "connected to SSE stream");
        self.dispatcher.submit_open();

        let bytes = response.bytes_stream().map_err(ClientError::from).boxed();
        let lines = LineSource::new(bytes, self.read_buffer_size);
        let directives: Arc<dyn StreamDirectives> = self.shared.clone();
        let mut parser = EventParser::new(
            lines,
            Arc::clone(&self.origin),
            Arc::clone(&self.dispatcher),
            directives,
            ParserOptions {
                stream_event_data: self.stream_event_data,
                expect_event: self.expect_event,
                expect_id: self.expect_id,
                initial_last_event_id: match self.shared.last_event_id_snapshot() {
                    Some(id) => {
                        let bytes = Bytes::from(id.into_bytes());
                        // Safety: the bytes came straight out of a String.
                        unsafe { Str::from_inner_unchecked(bytes) }
                    }
                    None => EMPTY_STR,
                },
            },
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(()),
            result = parser.run() => result,
        }
    }

    /// Routes a failure through the error policy; the user handler hears
    /// about it only if the policy proceeds and the client is not already
    /// shut down.
    fn dispatch_error(&self, error: ClientError) -> ErrorAction {
        let action = self.error_handler.on_connection_error(&error);
        if action != ErrorAction::Shutdown && self.shared.state.load() != ReadyState::Shutdown {
            self.dispatcher.submit_error(Arc::new(error));
        }
        action
    }

    /// Snapshots configuration plus the current `Last-Event-ID` into a
    /// request, applying the caller's transformer last.
    fn build_request(&self) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(self.method.clone(), Url::clone(&self.origin))
            .headers(self.headers.clone());

        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        if let Some(id) = self.shared.last_event_id_snapshot()
            && let Ok(value) = HeaderValue::from_str(&id)
        {
            request = request.header(LAST_EVENT_ID, value);
        }

        match &self.request_transformer {
            Some(transform) => transform(request),
            None => request,
        }
    }
}

/// The stream defaults, each yielding to a caller-provided header of the
/// same name.
fn merged_headers(custom: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !custom.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
    if !custom.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    for (name, value) in custom {
        headers.append(name.clone(), value.clone());
    }
    headers
}
