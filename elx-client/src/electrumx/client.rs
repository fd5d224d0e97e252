//! ElectrumX server connection.
//!
//! This module contains [`ServerConn`], which owns one transport session
//! end-to-end: dial, version negotiation, the read loop, the keepalive
//! loop, request/response correlation, the notification feeds, and
//! teardown.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{self, BoxedStream, FrameReader, FrameWriter};
use super::error::{ElectrumError, ElectrumResult};
use super::messages::{
    HeaderNotification, Notification, Params, ScripthashStatus, ServerMessage, decode,
    encode_request,
};
use super::pending::PendingRequests;

/// Protocol version requested during negotiation.
pub const PROTOCOL_VERSION: &str = "1.4";

/// Keepalive ping interval. ElectrumX disconnects idle sessions after
/// 600 seconds by default; pinging at half that leaves a wide margin.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(300);

/// Default bound on dial, TLS handshake and version negotiation together.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a single frame write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(7);

/// Largest version negotiation reply we accept.
const HANDSHAKE_FRAME_LIMIT: u64 = 1 << 18;

/// Tip notifications arrive one block at a time, or in small bursts
/// after a reorg.
const HEADERS_FEED_CAPACITY: usize = 64;

/// Enough for every address of a wallet with default gap limits to
/// change in one block.
const SCRIPTHASH_FEED_CAPACITY: usize = 256;

/// Connection options.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    /// TLS client configuration; `None` for plain TCP
    pub tls: Option<Arc<rustls::ClientConfig>>,

    /// SOCKS5 proxy address (host:port), e.g. a local Tor daemon
    pub proxy: Option<String>,

    /// Client name sent in `server.version`
    pub client_name: String,

    /// Bound on connect + handshake; `None` waits indefinitely
    pub connect_timeout: Option<Duration>,

    /// Keepalive ping interval
    pub ping_interval: Duration,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            tls: None,
            proxy: None,
            client_name: format!("elx-client/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Connection lifecycle.
///
/// `Dialing → Negotiating → Open → Closing → Closed`. A connection
/// handed to callers is always at least `Open`; it never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Dialing,
    Negotiating,
    Open,
    Closing,
    Closed,
}

/// Receiving end of a notification feed.
///
/// Cloneable; clones compete for items, each item goes to one reader.
/// `recv()` returns `None` once the connection has terminated.
pub struct NotifyFeed<T> {
    rx: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

impl<T> NotifyFeed<T> {
    fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    /// Wait for the next notification.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for NotifyFeed<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// State shared between the connection handle, the read loop and the
/// keepalive loop.
struct Shared {
    /// Write half; `None` once the connection has closed it
    writer: Arc<AsyncMutex<Option<FrameWriter>>>,

    /// In-flight requests
    pending: PendingRequests,

    /// Last request id handed out
    last_id: AtomicU64,

    /// Read deadline enforced by the read loop, extended by keepalive
    read_deadline: watch::Sender<Option<Instant>>,

    /// Cancels both loops; child of the caller's token
    shutdown: CancellationToken,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Write one frame. The only write path to the socket.
    ///
    /// Waiting for the writer gives up as soon as `cancel` fires or the
    /// connection shuts down. Once the writer is held the frame is
    /// written by a detached task, so an abandoned caller never leaves a
    /// partial frame on the stream.
    async fn send(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        frame: Vec<u8>,
    ) -> ElectrumResult<()> {
        let writer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ElectrumError::Canceled),
            _ = self.shutdown.cancelled() => return Err(ElectrumError::Terminated),
            writer = self.writer.clone().lock_owned() => writer,
        };

        let write = tokio::spawn(self.clone().write_frame(writer, frame));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ElectrumError::Canceled),
            _ = self.shutdown.cancelled() => Err(ElectrumError::Terminated),
            written = write => written.unwrap_or(Err(ElectrumError::Terminated)),
        }
    }

    async fn write_frame(
        self: Arc<Self>,
        mut writer: OwnedMutexGuard<Option<FrameWriter>>,
        frame: Vec<u8>,
    ) -> ElectrumResult<()> {
        let writer = writer.as_mut().ok_or(ElectrumError::Terminated)?;

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ElectrumError::Terminated),
            written = timeout(WRITE_TIMEOUT, writer.write_frame(&frame)) => {
                written.unwrap_or(Err(ElectrumError::Timeout))
            }
        };
        if let Err(e) = &result {
            if !self.shutdown.is_cancelled() {
                // A partial write leaves the stream unusable
                warn!(error = %e, "Write failed, closing connection");
                self.shutdown.cancel();
            }
        }
        result
    }

    async fn request<T: DeserializeOwned>(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        method: &str,
        params: Params,
    ) -> ElectrumResult<T> {
        let id = self.next_id();
        let frame = encode_request(id, method, &params)?;

        let mut pending = self.pending.register(id)?;
        self.send(cancel, frame).await?;
        trace!(id, method, "Request sent");

        let response = tokio::select! {
            response = pending.wait() => response?,
            _ = cancel.cancelled() => return Err(ElectrumError::Canceled),
        };
        response.into_result()
    }

    /// Shut down and drop the write half.
    async fn close_writer(&self) {
        let writer = match timeout(WRITE_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => writer.take(),
            Err(_) => {
                warn!("Timed out waiting for writer during close");
                return;
            }
        };
        if let Some(mut writer) = writer {
            let closed = timeout(WRITE_TIMEOUT, writer.shutdown())
                .await
                .unwrap_or(Err(ElectrumError::Timeout));
            if let Err(e) = closed {
                debug!(error = %e, "Error closing transport");
            }
        }
    }
}

/// Connection to an ElectrumX server.
///
/// Single use: once the connection terminates it stays terminated, and
/// the caller decides whether to reconnect to the same server or another
/// one. Terminal events are transport failure, a missed keepalive,
/// cancellation of the token passed at connect time, [`shutdown`], and
/// dropping the `ServerConn`.
///
/// All methods take `&self`; wrap in an `Arc` to share between tasks.
///
/// [`shutdown`]: ServerConn::shutdown
pub struct ServerConn {
    shared: Arc<Shared>,
    addr: String,
    proto: String,
    state: watch::Receiver<ConnState>,
    headers: NotifyFeed<HeaderNotification>,
    scripthash: NotifyFeed<ScripthashStatus>,
}

impl ServerConn {
    /// Connect to the server at `addr` (host:port).
    ///
    /// Dials (through `opts.proxy` if set), performs the TLS handshake
    /// if `opts.tls` is set, and negotiates the protocol version, all
    /// within `opts.connect_timeout`. Only then are the read and
    /// keepalive loops started. Cancelling `shutdown` later closes the
    /// connection.
    pub async fn connect(
        addr: &str,
        opts: ConnectOpts,
        shutdown: &CancellationToken,
    ) -> ElectrumResult<Self> {
        let deadline = opts.connect_timeout.map(|t| Instant::now() + t);
        let (state_tx, _) = watch::channel(ConnState::Dialing);

        let stream = with_deadline(
            deadline,
            connection::dial(addr, opts.proxy.as_deref(), opts.tls.clone()),
        )
        .await?;

        Self::handshake(addr.to_string(), stream, opts, deadline, state_tx, shutdown).await
    }

    /// Run the protocol over an already established stream.
    ///
    /// `opts.tls` and `opts.proxy` are ignored; the stream is used as is.
    /// `name` identifies the server in logs.
    pub async fn from_stream<S>(
        name: impl Into<String>,
        stream: S,
        opts: ConnectOpts,
        shutdown: &CancellationToken,
    ) -> ElectrumResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let deadline = opts.connect_timeout.map(|t| Instant::now() + t);
        let (state_tx, _) = watch::channel(ConnState::Dialing);
        Self::handshake(
            name.into(),
            Box::new(stream),
            opts,
            deadline,
            state_tx,
            shutdown,
        )
        .await
    }

    async fn handshake(
        addr: String,
        stream: BoxedStream,
        opts: ConnectOpts,
        deadline: Option<Instant>,
        state_tx: watch::Sender<ConnState>,
        parent: &CancellationToken,
    ) -> ElectrumResult<Self> {
        state_tx.send_replace(ConnState::Negotiating);
        let (mut reader, mut writer) = connection::split(stream);

        let negotiated = with_deadline(
            deadline,
            negotiate_version(&mut reader, &mut writer, &opts.client_name),
        )
        .await;
        let proto = match negotiated {
            Ok(proto) => proto,
            Err(e) => {
                debug!(addr = %addr, error = %e, "Version negotiation failed");
                let _ = timeout(WRITE_TIMEOUT, writer.shutdown()).await;
                return Err(e);
            }
        };

        info!(addr = %addr, proto = %proto, "Connected to server");

        let shutdown = parent.child_token();
        let (deadline_tx, deadline_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            writer: Arc::new(AsyncMutex::new(Some(writer))),
            pending: PendingRequests::new(),
            // The handshake used id 1
            last_id: AtomicU64::new(1),
            read_deadline: deadline_tx,
            shutdown: shutdown.clone(),
        });

        let (headers_tx, headers_rx) = mpsc::channel(HEADERS_FEED_CAPACITY);
        let (scripthash_tx, scripthash_rx) = mpsc::channel(SCRIPTHASH_FEED_CAPACITY);

        state_tx.send_replace(ConnState::Open);
        let state = state_tx.subscribe();

        tokio::spawn(
            ReadLoop {
                shared: shared.clone(),
                reader,
                headers_tx,
                scripthash_tx,
                deadline_rx,
                state_tx,
            }
            .run(),
        );
        tokio::spawn(keepalive_loop(shared.clone(), opts.ping_interval));

        Ok(Self {
            shared,
            addr,
            proto,
            state,
            headers: NotifyFeed::new(headers_rx),
            scripthash: NotifyFeed::new(scripthash_rx),
        })
    }

    /// Server address this connection was opened to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Negotiated protocol version, e.g. "1.4".
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Begin shutting down. Await [`done`](Self::done) to wait for
    /// completion.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Wait until the connection is fully closed: transport closed,
    /// feeds closed, and every pending request resolved.
    pub async fn done(&self) {
        let mut state = self.state.clone();
        // Sender dropped means the read loop already finished
        let _ = state.wait_for(|s| *s == ConnState::Closed).await;
    }

    /// Chain tip notifications, after [`subscribe_headers`].
    ///
    /// A single server message may carry several headers; each arrives
    /// separately, in order.
    ///
    /// [`subscribe_headers`]: ServerConn::subscribe_headers
    pub fn headers_notify(&self) -> NotifyFeed<HeaderNotification> {
        self.headers.clone()
    }

    /// Scripthash status notifications, after [`subscribe_scripthash`].
    ///
    /// [`subscribe_scripthash`]: ServerConn::subscribe_scripthash
    pub fn scripthash_notify(&self) -> NotifyFeed<ScripthashStatus> {
        self.scripthash.clone()
    }

    /// Send a request and wait for its result.
    ///
    /// Returns when the response arrives, when `cancel` fires
    /// ([`ElectrumError::Canceled`]), or when the connection terminates
    /// ([`ElectrumError::Terminated`]). A server error object surfaces as
    /// [`ElectrumError::Rpc`] and affects only this request. Dropping the
    /// returned future abandons the request; a late response is discarded.
    pub async fn request<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Params,
    ) -> ElectrumResult<T> {
        self.shared.request(cancel, method, params).await
    }

    /// Send a request and ignore its result payload.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Params,
    ) -> ElectrumResult<()> {
        self.request::<IgnoredAny>(cancel, method, params)
            .await
            .map(|_| ())
    }
}

impl Drop for ServerConn {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn with_deadline<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = ElectrumResult<T>>,
) -> ElectrumResult<T> {
    match deadline {
        Some(deadline) => timeout_at(deadline, fut)
            .await
            .map_err(|_| ElectrumError::Timeout)?,
        None => fut.await,
    }
}

/// True if `proto` is in the protocol line we requested.
fn is_supported_version(proto: &str) -> bool {
    proto == PROTOCOL_VERSION
        || proto
            .strip_prefix(PROTOCOL_VERSION)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Exchange `server.version` before any loop runs.
///
/// Reads the reply directly from the stream, so this must happen before
/// the read loop takes ownership of the reader.
async fn negotiate_version(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    client_name: &str,
) -> ElectrumResult<String> {
    const ID: u64 = 1;

    let params = Params::from(vec![json!(client_name), json!(PROTOCOL_VERSION)]);
    let frame = encode_request(ID, "server.version", &params)?;
    timeout(WRITE_TIMEOUT, writer.write_frame(&frame))
        .await
        .map_err(|_| ElectrumError::Timeout)??;

    let reply = reader
        .read_frame_limited(HANDSHAKE_FRAME_LIMIT)
        .await?
        .ok_or_else(|| {
            ElectrumError::ConnectionFailed(
                "connection closed during version negotiation".to_string(),
            )
        })?;

    let response = match decode(&reply)? {
        ServerMessage::Response(response) if response.id == ID => response,
        other => {
            return Err(ElectrumError::Codec(format!(
                "unexpected version negotiation reply: {:?}",
                other
            )));
        }
    };

    // [server_software_version, protocol_version]
    let (software, proto): (String, String) = response.into_result()?;
    debug!(software = %software, proto = %proto, "Server version");

    if !is_supported_version(&proto) {
        return Err(ElectrumError::UnsupportedVersion(proto));
    }
    Ok(proto)
}

/// The read loop: sole reader of the socket and sole writer of the
/// response slots and notification feeds.
///
/// Because it is the only sender, it is also the only task that may
/// close the feeds and fail the pending requests, which it does exactly
/// once on the way out.
struct ReadLoop {
    shared: Arc<Shared>,
    reader: FrameReader,
    headers_tx: mpsc::Sender<HeaderNotification>,
    scripthash_tx: mpsc::Sender<ScripthashStatus>,
    deadline_rx: watch::Receiver<Option<Instant>>,
    state_tx: watch::Sender<ConnState>,
}

impl ReadLoop {
    async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Connection shut down");
                    break;
                }
                _ = read_deadline_expired(&mut self.deadline_rx) => {
                    warn!("Read deadline expired, closing connection");
                    break;
                }
                result = self.reader.read_frame() => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        info!("Connection closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read failed, closing connection");
                        break;
                    }
                },
            };

            self.dispatch(&frame);
        }

        self.teardown().await;
    }

    fn dispatch(&self, frame: &[u8]) {
        match decode(frame) {
            Ok(ServerMessage::Response(response)) => {
                let id = response.id;
                if !self.shared.pending.resolve(response) {
                    debug!(id, "Response for unknown request id, dropping");
                }
            }
            Ok(ServerMessage::Notification(Notification::Headers(headers))) => {
                for header in headers {
                    trace!(height = header.height, "Chain tip notification");
                    deliver(&self.headers_tx, header, "headers");
                }
            }
            Ok(ServerMessage::Notification(Notification::ScripthashStatus(status))) => {
                trace!(scripthash = %status.scripthash, "Scripthash status notification");
                deliver(&self.scripthash_tx, status, "scripthash");
            }
            Ok(ServerMessage::Notification(Notification::Unknown { method })) => {
                debug!(method = %method, "Notification for unknown method, dropping");
            }
            Err(e) => {
                warn!(error = %e, "Skipping malformed frame");
            }
        }
    }

    async fn teardown(self) {
        self.state_tx.send_replace(ConnState::Closing);
        self.shared.shutdown.cancel();

        // Callers learn of the termination before the transport is closed,
        // which may wait on an in-progress write
        let outstanding = self.shared.pending.close_all();
        if outstanding > 0 {
            debug!(outstanding, "Terminated pending requests");
        }
        drop(self.headers_tx);
        drop(self.scripthash_tx);

        self.shared.close_writer().await;
        drop(self.reader);

        self.state_tx.send_replace(ConnState::Closed);
        debug!("Read loop stopped");
    }
}

/// Hand a notification to its feed without ever blocking the read loop.
///
/// A full feed means the consumer is not keeping up; dropping the
/// notification keeps the socket drained and pings answered.
fn deliver<T>(feed: &mpsc::Sender<T>, item: T, name: &'static str) {
    match feed.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(feed = name, "Notification feed full, dropping notification");
        }
        Err(TrySendError::Closed(_)) => {
            trace!(feed = name, "No notification consumer");
        }
    }
}

/// Resolve when the current read deadline passes. Extending the deadline
/// restarts the wait; no deadline waits forever.
async fn read_deadline_expired(rx: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *rx.borrow_and_update();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            sleep_until(deadline).await;
                            return;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// Keepalive: ping periodically so the server does not drop an idle
/// session, and notice a dead peer.
///
/// Before each ping the read deadline moves to 5/4 of the interval out.
/// The loop never reads; the ping's response comes back through the
/// read loop like any other.
async fn keepalive_loop(shared: Arc<Shared>, interval: Duration) {
    let shutdown = shared.shutdown.clone();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let deadline = Instant::now() + interval * 5 / 4;
        if shared.read_deadline.send(Some(deadline)).is_err() {
            debug!("Read loop gone, stopping keepalive");
            shutdown.cancel();
            break;
        }

        match shared
            .request::<IgnoredAny>(&shutdown, "server.ping", Params::none())
            .await
        {
            Ok(_) => trace!("Ping answered"),
            Err(ElectrumError::Canceled) => break,
            Err(e) => {
                warn!(error = %e, "Ping failed, closing connection");
                shutdown.cancel();
                break;
            }
        }
    }

    debug!("Keepalive loop stopped");
}
