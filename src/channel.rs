//! The cast channel: one TLS connection multiplexing virtual connections,
//! request/response correlation, heartbeat and spontaneous event routing.
//!
//! A connected channel runs a single worker thread that owns the transport.
//! The worker alternates between draining the outbound queue, driving the
//! heartbeat clock and polling the stream with a short read timeout, so
//! writes are serialized by construction and the length prefix of a frame is
//! never interleaved with another writer's bytes.

use std::collections::{HashMap, HashSet};
use std::io;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use prost::Message as _;
use serde_json::Value;

use crate::cast::cast_channel::{AuthChallenge, DeviceAuthMessage};
use crate::channels::{connection, heartbeat};
use crate::codec::{self, CastMessage, CastMessagePayload, FrameDecoder};
use crate::errors::Error;
use crate::events::{DispatchMode, Event, EventBus};
use crate::utils;

/// Endpoint id of the sender platform.
pub const DEFAULT_SENDER_ID: &str = "sender-0";
/// Endpoint id of the receiver platform.
pub const DEFAULT_RECEIVER_ID: &str = "receiver-0";
/// Wildcard destination addressing every endpoint on the device.
pub const BROADCAST_DESTINATION_ID: &str = "*";

const NAMESPACE_DEVICE_AUTH: &str = "urn:x-cast:com.google.cast.tp.deviceauth";

/// How long a single blocking read may stall the worker loop. Bounds both
/// the latency of outbound frames and the drift of the heartbeat clock.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Knobs recognized by the channel core.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Deadline for a single awaited request.
    pub request_timeout: Duration,
    /// How often a `PING` is sent while connected.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the channel is considered lost.
    pub heartbeat_grace: Duration,
    /// Whether a send on a disconnected channel reconnects first.
    pub auto_reconnect: bool,
    /// How listener callbacks are delivered.
    pub event_dispatch: DispatchMode,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_grace: Duration::from_secs(30),
            auto_reconnect: true,
            event_dispatch: DispatchMode::WorkerPool,
        }
    }
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Authenticating,
    Handshaking,
    Connected,
    Closing,
}

/// A live virtual connection `(source, destination)` opened with `CONNECT`
/// on the connection namespace. Cheap to clone; the channel owns the
/// session table, handles only point into it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    source: String,
    destination: String,
}

impl Session {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// Invoked exactly once when the session leaves the table, whether by local
/// close, remote `CLOSE` or channel shutdown.
pub type SessionClosedListener = Box<dyn Fn(&Session) + Send + 'static>;

#[derive(Default)]
struct SessionEntry {
    closed_listener: Option<SessionClosedListener>,
}

/// A response frame matched to a pending request: the discriminator string
/// and the full JSON tree it was read from.
#[derive(Debug, Clone)]
pub struct Response {
    pub typ: String,
    pub payload: Value,
}

/// Caller-side cancellation for an in-flight request.
#[derive(Clone)]
pub struct CancelHandle {
    trigger: Sender<()>,
    observer: Receiver<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (trigger, observer) = bounded(1);
        CancelHandle { trigger, observer }
    }

    /// Wakes the waiting caller with `Cancelled`. Idempotent.
    pub fn cancel(&self) {
        let _ = self.trigger.try_send(());
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

struct PendingRequest {
    expected: Vec<String>,
    completion: Sender<Result<Response, Error>>,
}

enum WorkerCommand {
    Send(CastMessage),
    Shutdown,
}

struct IoHandle {
    commands: Sender<WorkerCommand>,
    worker: JoinHandle<()>,
}

struct Shared {
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    pending: Mutex<HashMap<i64, PendingRequest>>,
    /// Request ids whose caller gave up; a late response with one of these
    /// ids is dropped instead of being dispatched as an event.
    expired: Mutex<HashSet<i64>>,
    sessions: Mutex<HashMap<Session, SessionEntry>>,
    request_ids: AtomicI64,
    events: EventBus,
}

pub(crate) type Transport = Box<dyn TransportStream>;

/// Byte stream the channel runs over. The read timeout is what lets one
/// worker thread multiplex reads, writes and the heartbeat clock.
pub(crate) trait TransportStream: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Produces a fresh transport for every (re)connect attempt.
pub(crate) type Dialer = Box<dyn Fn() -> Result<Transport, Error> + Send + Sync>;

/// A channel to one cast device. See the module docs for the threading
/// model; all public methods are safe to call from any thread.
pub struct Channel {
    shared: Arc<Shared>,
    dialer: Dialer,
    sender_id: String,
    io: Mutex<Option<IoHandle>>,
}

impl Channel {
    pub(crate) fn new(dialer: Dialer, config: ChannelConfig) -> Self {
        let events = EventBus::new(config.event_dispatch);

        Channel {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ChannelState::Disconnected),
                pending: Mutex::new(HashMap::new()),
                expired: Mutex::new(HashSet::new()),
                sessions: Mutex::new(HashMap::new()),
                request_ids: AtomicI64::new(1),
                events,
            }),
            dialer,
            sender_id: utils::generate_sender_id(),
            io: Mutex::new(None),
        }
    }

    /// The endpoint id this channel uses for application sessions. The
    /// platform endpoint always speaks as `sender-0`.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Listener registration surface for spontaneous events.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Establishes the channel: TLS connect, device auth, platform
    /// `CONNECT`, then reader and heartbeat start. A no-op when already
    /// connected; emits `Connected(true)` on success.
    pub fn connect(&self) -> Result<(), Error> {
        let mut io = lock(&self.io);

        {
            let mut state = lock(&self.shared.state);
            match *state {
                ChannelState::Connected => return Ok(()),
                ChannelState::Disconnected => *state = ChannelState::Authenticating,
                _ => return Err(Error::ChannelClosed),
            }
        }

        // Reap a worker left behind by a heartbeat loss.
        if let Some(stale) = io.take() {
            drop(stale.commands);
            let _ = stale.worker.join();
        }

        match self.establish() {
            Ok(handle) => {
                *io = Some(handle);
                *lock(&self.shared.state) = ChannelState::Connected;
                self.shared.events.fire(&Event::Connected(true));
                Ok(())
            }
            Err(err) => {
                *lock(&self.shared.state) = ChannelState::Disconnected;
                Err(err)
            }
        }
    }

    /// Closes the channel: best-effort `CLOSE` to every open session, worker
    /// stop, transport drop, and `ChannelClosed` for all outstanding
    /// requests. Idempotent and safe against racing senders.
    pub fn close(&self) -> Result<(), Error> {
        let handle = {
            let mut io = lock(&self.io);
            let mut state = lock(&self.shared.state);
            match *state {
                ChannelState::Disconnected => {
                    let stale = io.take();
                    drop(state);
                    drop(io);
                    if let Some(stale) = stale {
                        drop(stale.commands);
                        let _ = stale.worker.join();
                    }
                    return Ok(());
                }
                ChannelState::Closing => return Ok(()),
                _ => {}
            }
            *state = ChannelState::Closing;
            drop(state);
            io.take()
        };

        if let Some(handle) = handle {
            let sessions: Vec<Session> = lock(&self.shared.sessions).keys().cloned().collect();
            for session in sessions {
                if let Ok(message) =
                    connection::close_message(session.source(), session.destination())
                {
                    let _ = handle.commands.send(WorkerCommand::Send(message));
                }
            }
            let _ = handle.commands.send(WorkerCommand::Shutdown);
            let _ = handle.worker.join();
        } else {
            // The state said connecting/connected but no worker exists; put
            // the machine back into a defined state.
            teardown(&self.shared);
        }

        Ok(())
    }

    /// Opens a virtual connection from `source` to `destination`. Returns
    /// the existing session when one is already open for the pair.
    pub fn start_session(&self, source: &str, destination: &str) -> Result<Session, Error> {
        self.ensure_connected()?;

        let session = Session {
            source: source.to_string(),
            destination: destination.to_string(),
        };

        if lock(&self.shared.sessions).contains_key(&session) {
            return Ok(session);
        }

        self.enqueue(connection::connect_message(source, destination)?)?;
        lock(&self.shared.sessions)
            .entry(session.clone())
            .or_default();

        log::debug!("Session {} -> {} opened", source, destination);
        Ok(session)
    }

    /// Closes a virtual connection. A no-op for a session that is already
    /// closed.
    pub fn close_session(&self, session: &Session) -> Result<(), Error> {
        let entry = lock(&self.shared.sessions).remove(session);

        if let Some(entry) = entry {
            let result = self
                .enqueue(connection::close_message(session.source(), session.destination())?);
            if let Some(listener) = entry.closed_listener {
                listener(session);
            }
            result?;
            log::debug!(
                "Session {} -> {} closed",
                session.source(),
                session.destination()
            );
        }

        Ok(())
    }

    pub fn is_session_closed(&self, session: &Session) -> bool {
        !lock(&self.shared.sessions).contains_key(session)
    }

    /// Installs the single close listener of a session, replacing any
    /// previous one.
    pub fn set_session_closed_listener<F>(&self, session: &Session, listener: F) -> Result<(), Error>
    where
        F: Fn(&Session) + Send + 'static,
    {
        match lock(&self.shared.sessions).get_mut(session) {
            Some(entry) => {
                entry.closed_listener = Some(Box::new(listener));
                Ok(())
            }
            None => Err(Error::InvalidOperation(
                "session is not open on this channel".to_string(),
            )),
        }
    }

    /// Fire-and-forget send of a JSON payload. No request id is assigned.
    pub fn send(
        &self,
        namespace: &str,
        source: &str,
        destination: &str,
        payload: Value,
    ) -> Result<(), Error> {
        self.ensure_connected()?;
        self.enqueue(string_message(namespace, source, destination, &payload)?)
    }

    /// Sends a JSON payload and blocks until a response with the same
    /// request id arrives, the deadline elapses, the caller cancels, or the
    /// channel closes.
    ///
    /// `expected` lists the response discriminators that belong to this
    /// request family; a matched response outside of it fails the caller
    /// with `UnexpectedResponse` while still reaching event listeners. An
    /// empty slice accepts any discriminator.
    pub fn request(
        &self,
        namespace: &str,
        source: &str,
        destination: &str,
        mut payload: Value,
        expected: &[&str],
        timeout: Option<Duration>,
        cancel: Option<&CancelHandle>,
    ) -> Result<Response, Error> {
        self.ensure_connected()?;

        let request_id = self.shared.request_ids.fetch_add(1, Ordering::Relaxed);
        match payload {
            Value::Object(ref mut object) => {
                object.insert("requestId".to_string(), request_id.into());
            }
            _ => {
                return Err(Error::InvalidOperation(
                    "request payload must be a JSON object".to_string(),
                ))
            }
        }

        let (completion, completed) = bounded(1);
        lock(&self.shared.pending).insert(
            request_id,
            PendingRequest {
                expected: expected.iter().map(|s| s.to_string()).collect(),
                completion,
            },
        );

        let message = match string_message(namespace, source, destination, &payload) {
            Ok(message) => message,
            Err(err) => {
                lock(&self.shared.pending).remove(&request_id);
                return Err(err);
            }
        };
        if let Err(err) = self.enqueue(message) {
            lock(&self.shared.pending).remove(&request_id);
            return Err(err);
        }

        let timeout = timeout.unwrap_or(self.shared.config.request_timeout);
        match cancel {
            None => match completed.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    self.abandon(request_id, &completed, Error::Timeout)
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    Err(Error::ChannelClosed)
                }
            },
            Some(handle) => {
                select! {
                    recv(completed) -> outcome => outcome.unwrap_or(Err(Error::ChannelClosed)),
                    recv(handle.observer) -> _ => self.abandon(request_id, &completed, Error::Cancelled),
                    default(timeout) => self.abandon(request_id, &completed, Error::Timeout),
                }
            }
        }
    }

    /// Gives up on a request. The worker completes entries while holding the
    /// pending lock, so either the entry is still ours to remove (the
    /// response may only arrive later and must be swallowed) or a completed
    /// outcome is already waiting in the handle.
    fn abandon(
        &self,
        request_id: i64,
        completed: &Receiver<Result<Response, Error>>,
        reason: Error,
    ) -> Result<Response, Error> {
        let removed = {
            let mut pending = lock(&self.shared.pending);
            let removed = pending.remove(&request_id).is_some();
            if removed {
                lock(&self.shared.expired).insert(request_id);
            }
            removed
        };

        if removed {
            Err(reason)
        } else {
            completed
                .try_recv()
                .unwrap_or(Err(Error::ChannelClosed))
        }
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        match self.state() {
            ChannelState::Connected => Ok(()),
            ChannelState::Disconnected if self.shared.config.auto_reconnect => self.connect(),
            _ => Err(Error::ChannelClosed),
        }
    }

    fn enqueue(&self, message: CastMessage) -> Result<(), Error> {
        let io = lock(&self.io);
        match io.as_ref() {
            Some(handle) => handle
                .commands
                .send(WorkerCommand::Send(message))
                .map_err(|_| Error::ChannelClosed),
            None => Err(Error::ChannelClosed),
        }
    }

    /// Dial, authenticate, open the platform connection and hand the
    /// transport over to the worker. Runs with the io lock held.
    fn establish(&self) -> Result<IoHandle, Error> {
        let mut transport = (self.dialer)()?;
        transport.set_read_timeout(Some(READ_POLL_INTERVAL))?;

        let mut decoder = FrameDecoder::default();
        self.authenticate(&mut transport, &mut decoder)?;

        *lock(&self.shared.state) = ChannelState::Handshaking;

        write_frame(
            &mut transport,
            &connection::connect_message(DEFAULT_SENDER_ID, DEFAULT_RECEIVER_ID)?,
        )?;
        lock(&self.shared.sessions)
            .entry(Session {
                source: DEFAULT_SENDER_ID.to_string(),
                destination: DEFAULT_RECEIVER_ID.to_string(),
            })
            .or_default();

        let (commands, command_queue) = unbounded();
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("cast-channel".to_string())
            .spawn(move || run_worker(shared, transport, decoder, command_queue))
            .map_err(Error::Io)?;

        Ok(IoHandle { commands, worker })
    }

    /// One binary round trip on the device auth namespace. The challenge is
    /// empty and the reply is accepted as-is; the device certificate chain
    /// is never validated here.
    fn authenticate(
        &self,
        transport: &mut Transport,
        decoder: &mut FrameDecoder,
    ) -> Result<(), Error> {
        let challenge = DeviceAuthMessage {
            challenge: Some(AuthChallenge::default()),
            response: None,
            error: None,
        };
        write_frame(
            transport,
            &CastMessage {
                namespace: NAMESPACE_DEVICE_AUTH.to_string(),
                source: DEFAULT_SENDER_ID.to_string(),
                destination: DEFAULT_RECEIVER_ID.to_string(),
                payload: CastMessagePayload::Binary(challenge.encode_to_vec()),
            },
        )?;

        let deadline = Instant::now() + self.shared.config.request_timeout;
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            while let Some(frame) = decoder.try_next()? {
                if frame.namespace != NAMESPACE_DEVICE_AUTH {
                    log::debug!(
                        "Ignoring frame on {} while waiting for device auth",
                        frame.namespace
                    );
                    continue;
                }
                if let CastMessagePayload::Binary(bytes) = &frame.payload {
                    match DeviceAuthMessage::decode(bytes.as_slice()) {
                        Ok(reply) if reply.error.is_some() => {
                            log::warn!("Device auth reply carries an error; proceeding anyway")
                        }
                        Ok(_) => log::debug!("Device auth reply accepted"),
                        Err(err) => log::warn!("Unparseable device auth reply accepted: {err}"),
                    }
                }
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }

            match transport.read(&mut buffer) {
                Ok(0) => {
                    if decoder.is_mid_frame() {
                        log::warn!("Stream ended inside a partial frame");
                    }
                    return Err(Error::ChannelClosed);
                }
                Ok(n) => decoder.extend(&buffer[..n]),
                Err(err) if is_poll_timeout(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn string_message(
    namespace: &str,
    source: &str,
    destination: &str,
    payload: &Value,
) -> Result<CastMessage, Error> {
    Ok(CastMessage {
        namespace: namespace.to_string(),
        source: source.to_string(),
        destination: destination.to_string(),
        payload: CastMessagePayload::String(serde_json::to_string(payload)?),
    })
}

fn write_frame(transport: &mut Transport, message: &CastMessage) -> Result<(), Error> {
    let frame = codec::encode(message)?;
    transport.write_all(&frame)?;
    transport.flush()?;
    log::trace!(
        "Frame sent to {} on {}",
        message.destination,
        message.namespace
    );
    Ok(())
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// The worker loop. Owns the transport until the channel dies; every exit
/// path funnels through [`teardown`].
fn run_worker(
    shared: Arc<Shared>,
    mut transport: Transport,
    mut decoder: FrameDecoder,
    commands: Receiver<WorkerCommand>,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut last_ping = Instant::now();
    let mut last_frame = Instant::now();

    let exit: Result<(), Error> = 'io: loop {
        loop {
            match commands.try_recv() {
                Ok(WorkerCommand::Send(message)) => {
                    if let Err(err) = write_frame(&mut transport, &message) {
                        break 'io Err(err);
                    }
                }
                Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    break 'io Ok(())
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if last_ping.elapsed() >= shared.config.heartbeat_interval {
            match heartbeat::ping_message() {
                Ok(ping) => {
                    if let Err(err) = write_frame(&mut transport, &ping) {
                        break 'io Err(err);
                    }
                }
                Err(err) => break 'io Err(err),
            }
            last_ping = Instant::now();
        }

        if last_frame.elapsed() >= shared.config.heartbeat_grace {
            log::warn!(
                "No frame observed for {:?}, considering the channel lost",
                shared.config.heartbeat_grace
            );
            break 'io Err(Error::ChannelClosed);
        }

        match transport.read(&mut buffer) {
            Ok(0) => {
                if decoder.is_mid_frame() {
                    log::warn!("Stream ended inside a partial frame");
                }
                break 'io Err(Error::ChannelClosed);
            }
            Ok(n) => {
                decoder.extend(&buffer[..n]);
                loop {
                    match decoder.try_next() {
                        Ok(Some(frame)) => {
                            last_frame = Instant::now();
                            if let Err(err) = handle_frame(&shared, &mut transport, frame) {
                                break 'io Err(err);
                            }
                        }
                        Ok(None) => break,
                        // Frame-level failures mean the stream is
                        // desynchronized; there is no way to resync.
                        Err(err) => break 'io Err(err),
                    }
                }
            }
            Err(err) if is_poll_timeout(&err) => {}
            Err(err) => break 'io Err(err.into()),
        }
    };

    match exit {
        Ok(()) => log::debug!("Channel worker stopped"),
        Err(err) => log::warn!("Channel worker died: {err}"),
    }

    teardown(&shared);
}

fn handle_frame(
    shared: &Arc<Shared>,
    transport: &mut Transport,
    frame: CastMessage,
) -> Result<(), Error> {
    if frame.namespace == heartbeat::CHANNEL_NAMESPACE {
        if let Some(typ) = string_payload_type(&frame) {
            if typ == heartbeat::MESSAGE_TYPE_PING {
                write_frame(transport, &heartbeat::pong_message(&frame.source)?)?;
            }
        }
        return Ok(());
    }

    if frame.namespace == NAMESPACE_DEVICE_AUTH {
        log::debug!("Ignoring device auth frame outside of connect");
        return Ok(());
    }

    if frame.namespace == connection::CHANNEL_NAMESPACE {
        if let Some(typ) = string_payload_type(&frame) {
            if typ == connection::MESSAGE_TYPE_CLOSE {
                handle_remote_close(shared, &frame);
            }
        }
        return Ok(());
    }

    let payload = match &frame.payload {
        CastMessagePayload::String(payload) => payload,
        CastMessagePayload::Binary(_) => {
            log::warn!(
                "Dropping unexpected binary payload on {}",
                frame.namespace
            );
            return Ok(());
        }
    };

    // A payload that is not valid JSON is a protocol hiccup of one message,
    // not a framing desync: skip it.
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("Dropping unparseable payload on {}: {err}", frame.namespace);
            return Ok(());
        }
    };

    let request_id = value.get("requestId").and_then(Value::as_i64).unwrap_or(0);
    let typ = response_type(&value);

    if request_id > 0 {
        if lock(&shared.expired).remove(&request_id) {
            log::debug!("Dropping late response for timed out request {request_id}");
            return Ok(());
        }

        let mut pending = lock(&shared.pending);
        if let Some(entry) = pending.remove(&request_id) {
            if entry.expected.is_empty() || entry.expected.iter().any(|e| e == &typ) {
                let _ = entry.completion.send(Ok(Response {
                    typ,
                    payload: value,
                }));
            } else {
                // Fail the caller, but the decoded value still reaches
                // listeners.
                let _ = entry
                    .completion
                    .send(Err(Error::UnexpectedResponse(typ.clone())));
                drop(pending);
                shared.events.fire(&Event::from_payload(&typ, value));
            }
            return Ok(());
        }
    }

    shared.events.fire(&Event::from_payload(&typ, value));
    Ok(())
}

/// The remote closed a virtual connection: the session keyed by our
/// (destination, source) view of the frame goes away; an unmatched `CLOSE`
/// surfaces as an event instead.
fn handle_remote_close(shared: &Arc<Shared>, frame: &CastMessage) {
    let session = Session {
        source: frame.destination.clone(),
        destination: frame.source.clone(),
    };

    let entry = lock(&shared.sessions).remove(&session);
    match entry {
        Some(entry) => {
            log::debug!(
                "Remote closed session {} -> {}",
                session.source(),
                session.destination()
            );
            if let Some(listener) = entry.closed_listener {
                listener(&session);
            }
        }
        None => shared.events.fire(&Event::Close {
            peer: frame.source.clone(),
        }),
    }
}

fn string_payload_type(frame: &CastMessage) -> Option<String> {
    match &frame.payload {
        CastMessagePayload::String(payload) => serde_json::from_str::<Value>(payload)
            .ok()?
            .get("type")?
            .as_str()
            .map(str::to_string),
        CastMessagePayload::Binary(_) => None,
    }
}

/// Responses carry `responseType`; transport-level messages carry `type`.
/// Read whichever is present.
fn response_type(value: &Value) -> String {
    value
        .get("responseType")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Moves the machine to `Disconnected`, fails every outstanding request with
/// `ChannelClosed`, drains the session table (notifying close listeners) and
/// emits `Connected(false)`.
fn teardown(shared: &Arc<Shared>) {
    *lock(&shared.state) = ChannelState::Disconnected;

    let outstanding: Vec<PendingRequest> = {
        let mut pending = lock(&shared.pending);
        pending.drain().map(|(_, entry)| entry).collect()
    };
    for entry in outstanding {
        let _ = entry.completion.send(Err(Error::ChannelClosed));
    }
    lock(&shared.expired).clear();

    let sessions: Vec<(Session, SessionEntry)> = {
        let mut sessions = lock(&shared.sessions);
        sessions.drain().collect()
    };
    for (session, entry) in sessions {
        if let Some(listener) = entry.closed_listener {
            listener(&session);
        }
    }

    shared.events.fire(&Event::Connected(false));
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::mpsc;

    use serde_json::json;

    use super::*;
    use crate::events::EventType;

    /// In-memory byte stream: reads pop chunks pushed by the mock device,
    /// writes are forwarded to it. `recv_timeout` plays the role of the
    /// socket read timeout.
    pub struct MockStream {
        incoming: Receiver<Vec<u8>>,
        outgoing: Sender<Vec<u8>>,
        staged: Vec<u8>,
        read_timeout: Duration,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.staged.is_empty() {
                match self.incoming.recv_timeout(self.read_timeout) {
                    Ok(chunk) => self.staged = chunk,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        return Err(io::Error::new(io::ErrorKind::WouldBlock, "poll timeout"))
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(0),
                }
            }
            let n = buf.len().min(self.staged.len());
            buf[..n].copy_from_slice(&self.staged[..n]);
            self.staged.drain(..n);
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl TransportStream for MockStream {
        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
            if let Some(timeout) = timeout {
                self.read_timeout = timeout;
            }
            Ok(())
        }
    }

    /// Scripted peer: reads frames the channel wrote, responds in kind.
    pub struct MockDevice {
        to_channel: Sender<Vec<u8>>,
        from_channel: Receiver<Vec<u8>>,
        decoder: FrameDecoder,
    }

    impl MockDevice {
        pub fn next_frame(&mut self) -> CastMessage {
            self.try_next_frame(Duration::from_secs(5))
                .expect("mock device expected a frame")
        }

        pub fn try_next_frame(&mut self, timeout: Duration) -> Option<CastMessage> {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(frame) = self.decoder.try_next().unwrap() {
                    return Some(frame);
                }
                let remaining = deadline.checked_duration_since(Instant::now())?;
                match self.from_channel.recv_timeout(remaining) {
                    Ok(chunk) => self.decoder.extend(&chunk),
                    Err(_) => return None,
                }
            }
        }

        /// Skips heartbeat traffic until a frame on `namespace` arrives.
        pub fn next_frame_on(&mut self, namespace: &str) -> CastMessage {
            loop {
                let frame = self.next_frame();
                if frame.namespace == namespace {
                    return frame;
                }
            }
        }

        pub fn send_frame(&self, frame: &CastMessage) {
            self.to_channel
                .send(codec::encode(frame).unwrap())
                .unwrap();
        }

        pub fn send_json(&self, namespace: &str, source: &str, destination: &str, value: Value) {
            self.send_frame(&CastMessage {
                namespace: namespace.to_string(),
                source: source.to_string(),
                destination: destination.to_string(),
                payload: CastMessagePayload::String(value.to_string()),
            });
        }

        /// Answers the device-auth challenge and consumes the platform
        /// `CONNECT` that follows it. Skips frames left over from a
        /// previous incarnation of the channel.
        pub fn accept_connect(&mut self) {
            let auth = self.next_frame_on(NAMESPACE_DEVICE_AUTH);
            assert!(matches!(auth.payload, CastMessagePayload::Binary(_)));

            let reply = DeviceAuthMessage {
                challenge: None,
                response: Some(Default::default()),
                error: None,
            };
            self.send_frame(&CastMessage {
                namespace: NAMESPACE_DEVICE_AUTH.to_string(),
                source: DEFAULT_RECEIVER_ID.to_string(),
                destination: DEFAULT_SENDER_ID.to_string(),
                payload: CastMessagePayload::Binary(reply.encode_to_vec()),
            });

            let connect = self.next_frame_on(connection::CHANNEL_NAMESPACE);
            assert_eq!(payload_json(&connect)["type"], "CONNECT");
            assert_eq!(connect.destination, DEFAULT_RECEIVER_ID);
        }
    }

    pub fn payload_json(frame: &CastMessage) -> Value {
        match &frame.payload {
            CastMessagePayload::String(payload) => serde_json::from_str(payload).unwrap(),
            CastMessagePayload::Binary(_) => panic!("expected a string payload"),
        }
    }

    /// A channel whose dialer hands out in-memory streams wired to the
    /// returned mock device. Reconnects reuse the same pipes.
    pub fn test_channel(config: ChannelConfig) -> (Channel, MockDevice) {
        let (to_channel, channel_incoming) = unbounded::<Vec<u8>>();
        let (channel_outgoing, from_channel) = unbounded::<Vec<u8>>();

        let dialer: Dialer = Box::new(move || {
            Ok(Box::new(MockStream {
                incoming: channel_incoming.clone(),
                outgoing: channel_outgoing.clone(),
                staged: Vec::new(),
                read_timeout: READ_POLL_INTERVAL,
            }) as Transport)
        });

        let channel = Channel::new(dialer, config);
        let device = MockDevice {
            to_channel,
            from_channel,
            decoder: FrameDecoder::default(),
        };

        (channel, device)
    }

    pub fn inline_config() -> ChannelConfig {
        ChannelConfig {
            event_dispatch: DispatchMode::Inline,
            ..ChannelConfig::default()
        }
    }

    /// Runs `connect` while the mock device answers the handshake.
    fn connect(channel: &Channel, mut device: MockDevice) -> MockDevice {
        let script = thread::spawn(move || {
            device.accept_connect();
            device
        });
        channel.connect().unwrap();
        script.join().unwrap()
    }

    #[test]
    fn connect_authenticates_then_opens_platform_connection() {
        let (channel, device) = test_channel(inline_config());
        let (tx, rx) = mpsc::channel();
        channel.events().add(&[EventType::Connected], move |event| {
            if let Event::Connected(up) = event {
                tx.send(*up).unwrap();
            }
        });

        let _device = connect(&channel, device);

        assert!(channel.is_connected());
        assert_eq!(rx.try_recv().unwrap(), true);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connect_is_idempotent() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        channel.connect().unwrap();

        // No second auth exchange shows up.
        assert!(device.try_next_frame(Duration::from_millis(100)).is_none());
        assert!(channel.is_connected());
    }

    #[test]
    fn request_is_correlated_by_request_id() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        let script = thread::spawn(move || {
            let frame = device.next_frame_on("urn:x-cast:com.google.cast.receiver");
            let payload = payload_json(&frame);
            assert_eq!(payload["type"], "GET_STATUS");
            let request_id = payload["requestId"].as_i64().unwrap();
            assert!(request_id > 0);

            device.send_json(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_RECEIVER_ID,
                DEFAULT_SENDER_ID,
                json!({
                    "responseType": "RECEIVER_STATUS",
                    "requestId": request_id,
                    "status": {"volume": {"level": 1.0, "muted": false}},
                }),
            );
            device
        });

        let response = channel
            .request(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_SENDER_ID,
                DEFAULT_RECEIVER_ID,
                json!({"type": "GET_STATUS"}),
                &["RECEIVER_STATUS"],
                None,
                None,
            )
            .unwrap();

        assert_eq!(response.typ, "RECEIVER_STATUS");
        assert_eq!(response.payload["status"]["volume"]["level"], 1.0);
        script.join().unwrap();
    }

    #[test]
    fn spontaneous_frames_do_not_satisfy_pending_requests() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        let (tx, rx) = mpsc::channel();
        channel.events().add(&[EventType::Unknown], move |event| {
            if let Event::Unknown { typ, .. } = event {
                tx.send(typ.clone()).unwrap();
            }
        });

        let script = thread::spawn(move || {
            let frame = device.next_frame_on("urn:x-cast:com.google.cast.receiver");
            let request_id = payload_json(&frame)["requestId"].as_i64().unwrap();

            // A spontaneous status overtakes the response.
            device.send_json(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_RECEIVER_ID,
                DEFAULT_SENDER_ID,
                json!({"responseType": "SOME_BROADCAST", "requestId": 0}),
            );
            device.send_json(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_RECEIVER_ID,
                DEFAULT_SENDER_ID,
                json!({"responseType": "RECEIVER_STATUS", "requestId": request_id,
                       "status": {"volume": {}}}),
            );
            device
        });

        let response = channel
            .request(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_SENDER_ID,
                DEFAULT_RECEIVER_ID,
                json!({"type": "GET_STATUS"}),
                &["RECEIVER_STATUS"],
                None,
                None,
            )
            .unwrap();

        assert_eq!(response.typ, "RECEIVER_STATUS");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "SOME_BROADCAST");
        script.join().unwrap();
    }

    #[test]
    fn timeout_fails_one_request_and_swallows_the_late_response() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        let (tx, rx) = mpsc::channel();
        channel
            .events()
            .add(&[EventType::ReceiverStatus, EventType::Unknown], move |_| {
                tx.send(()).unwrap();
            });

        let first = channel.request(
            "urn:x-cast:com.google.cast.receiver",
            DEFAULT_SENDER_ID,
            DEFAULT_RECEIVER_ID,
            json!({"type": "GET_STATUS"}),
            &["RECEIVER_STATUS"],
            Some(Duration::from_millis(100)),
            None,
        );
        assert!(matches!(first, Err(Error::Timeout)));

        // The device answers long after the caller gave up; the response
        // must be dropped, not dispatched.
        let frame = device.next_frame_on("urn:x-cast:com.google.cast.receiver");
        let stale_id = payload_json(&frame)["requestId"].as_i64().unwrap();
        device.send_json(
            "urn:x-cast:com.google.cast.receiver",
            DEFAULT_RECEIVER_ID,
            DEFAULT_SENDER_ID,
            json!({"responseType": "RECEIVER_STATUS", "requestId": stale_id,
                   "status": {"volume": {}}}),
        );

        // The reader stayed alive: a fresh request succeeds.
        let script = thread::spawn(move || {
            let frame = device.next_frame_on("urn:x-cast:com.google.cast.receiver");
            let request_id = payload_json(&frame)["requestId"].as_i64().unwrap();
            assert_ne!(request_id, stale_id);
            device.send_json(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_RECEIVER_ID,
                DEFAULT_SENDER_ID,
                json!({"responseType": "RECEIVER_STATUS", "requestId": request_id,
                       "status": {"volume": {}}}),
            );
            device
        });

        let second = channel
            .request(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_SENDER_ID,
                DEFAULT_RECEIVER_ID,
                json!({"type": "GET_STATUS"}),
                &["RECEIVER_STATUS"],
                None,
                None,
            )
            .unwrap();
        assert_eq!(second.typ, "RECEIVER_STATUS");

        script.join().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancelled_request_fails_with_cancelled() {
        let (channel, device) = test_channel(inline_config());
        let _device = connect(&channel, device);

        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let result = channel.request(
            "urn:x-cast:com.google.cast.receiver",
            DEFAULT_SENDER_ID,
            DEFAULT_RECEIVER_ID,
            json!({"type": "GET_STATUS"}),
            &["RECEIVER_STATUS"],
            None,
            Some(&cancel),
        );

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn unexpected_discriminator_fails_caller_and_reaches_listeners() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        let (tx, rx) = mpsc::channel();
        channel.events().add(&[EventType::MediaStatus], move |event| {
            if let Event::MediaStatus(statuses) = event {
                tx.send(statuses.len()).unwrap();
            }
        });

        let script = thread::spawn(move || {
            let frame = device.next_frame_on("urn:x-cast:com.google.cast.receiver");
            let request_id = payload_json(&frame)["requestId"].as_i64().unwrap();
            device.send_json(
                "urn:x-cast:com.google.cast.media",
                DEFAULT_RECEIVER_ID,
                DEFAULT_SENDER_ID,
                json!({"responseType": "MEDIA_STATUS", "requestId": request_id, "status": []}),
            );
            device
        });

        let result = channel.request(
            "urn:x-cast:com.google.cast.receiver",
            DEFAULT_SENDER_ID,
            DEFAULT_RECEIVER_ID,
            json!({"type": "GET_STATUS"}),
            &["RECEIVER_STATUS"],
            None,
            None,
        );

        assert!(matches!(result, Err(Error::UnexpectedResponse(ref typ)) if typ == "MEDIA_STATUS"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        script.join().unwrap();
    }

    #[test]
    fn incoming_ping_is_answered_with_pong() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        device.send_json(
            heartbeat::CHANNEL_NAMESPACE,
            DEFAULT_RECEIVER_ID,
            DEFAULT_SENDER_ID,
            json!({"type": "PING"}),
        );

        let pong = device.next_frame_on(heartbeat::CHANNEL_NAMESPACE);
        // The worker's own PING can interleave here.
        let pong = if payload_json(&pong)["type"] == "PING" {
            device.next_frame_on(heartbeat::CHANNEL_NAMESPACE)
        } else {
            pong
        };
        assert_eq!(payload_json(&pong)["type"], "PONG");
        assert_eq!(pong.destination, DEFAULT_RECEIVER_ID);
        drop(channel);
    }

    #[test]
    fn heartbeat_pings_flow_while_idle() {
        let (channel, device) = test_channel(ChannelConfig {
            heartbeat_interval: Duration::from_millis(100),
            ..inline_config()
        });
        let mut device = connect(&channel, device);

        let ping = device.next_frame_on(heartbeat::CHANNEL_NAMESPACE);
        assert_eq!(payload_json(&ping)["type"], "PING");
        assert_eq!(ping.source, DEFAULT_SENDER_ID);
        assert_eq!(ping.destination, DEFAULT_RECEIVER_ID);
        drop(channel);
    }

    #[test]
    fn start_session_is_idempotent_and_sends_one_connect() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        let first = channel.start_session(channel.sender_id(), "transport-1").unwrap();
        let second = channel.start_session(channel.sender_id(), "transport-1").unwrap();
        assert_eq!(first, second);

        let connect = device.next_frame_on(connection::CHANNEL_NAMESPACE);
        assert_eq!(payload_json(&connect)["type"], "CONNECT");
        assert_eq!(connect.destination, "transport-1");
        assert!(device.try_next_frame(Duration::from_millis(100)).map_or(true, |frame| {
            frame.namespace != connection::CHANNEL_NAMESPACE
        }));
    }

    #[test]
    fn remote_close_tears_down_the_session_and_notifies_once() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);

        let session = channel.start_session(channel.sender_id(), "transport-1").unwrap();
        let _connect = device.next_frame_on(connection::CHANNEL_NAMESPACE);

        let (tx, rx) = mpsc::channel();
        channel
            .set_session_closed_listener(&session, move |session| {
                tx.send(session.destination().to_string()).unwrap();
            })
            .unwrap();

        device.send_json(
            connection::CHANNEL_NAMESPACE,
            "transport-1",
            channel.sender_id(),
            json!({"type": "CLOSE"}),
        );

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "transport-1"
        );
        assert!(channel.is_session_closed(&session));
    }

    #[test]
    fn close_of_unknown_session_surfaces_as_event() {
        let (channel, device) = test_channel(inline_config());
        let device = connect(&channel, device);

        let (tx, rx) = mpsc::channel();
        channel.events().add(&[EventType::Close], move |event| {
            if let Event::Close { peer } = event {
                tx.send(peer.clone()).unwrap();
            }
        });

        device.send_json(
            connection::CHANNEL_NAMESPACE,
            "transport-9",
            "sender-nobody",
            json!({"type": "CLOSE"}),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "transport-9");
    }

    #[test]
    fn close_fails_outstanding_requests_and_emits_disconnected() {
        let (channel, device) = test_channel(inline_config());
        let mut device = connect(&channel, device);
        let channel = Arc::new(channel);

        let (tx, rx) = mpsc::channel();
        channel.events().add(&[EventType::Connected], move |event| {
            if let Event::Connected(up) = event {
                tx.send(*up).unwrap();
            }
        });

        let waiting = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                channel.request(
                    "urn:x-cast:com.google.cast.receiver",
                    DEFAULT_SENDER_ID,
                    DEFAULT_RECEIVER_ID,
                    json!({"type": "GET_STATUS"}),
                    &["RECEIVER_STATUS"],
                    None,
                    None,
                )
            })
        };

        // Wait until the request is on the wire, then close underneath it.
        let _ = device.next_frame_on("urn:x-cast:com.google.cast.receiver");
        channel.close().unwrap();

        assert!(matches!(waiting.join().unwrap(), Err(Error::ChannelClosed)));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);

        // CLOSE went out for the platform session, best effort.
        let close = device.next_frame_on(connection::CHANNEL_NAMESPACE);
        assert_eq!(payload_json(&close)["type"], "CLOSE");

        // Idempotent.
        channel.close().unwrap();
    }

    #[test]
    fn send_after_close_observes_channel_closed() {
        let (channel, device) = test_channel(ChannelConfig {
            auto_reconnect: false,
            ..inline_config()
        });
        let _device = connect(&channel, device);

        channel.close().unwrap();

        let result = channel.send(
            "urn:x-cast:com.google.cast.receiver",
            DEFAULT_SENDER_ID,
            DEFAULT_RECEIVER_ID,
            json!({"type": "GET_STATUS"}),
        );
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[test]
    fn heartbeat_silence_kills_the_channel_and_reconnect_revives_it() {
        let (channel, device) = test_channel(ChannelConfig {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_grace: Duration::from_millis(400),
            ..inline_config()
        });
        let mut device = connect(&channel, device);
        let channel = Arc::new(channel);

        let (tx, rx) = mpsc::channel();
        channel.events().add(&[EventType::Connected], move |event| {
            if let Event::Connected(up) = event {
                tx.send(*up).unwrap();
            }
        });

        let waiting = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                channel.request(
                    "urn:x-cast:com.google.cast.receiver",
                    DEFAULT_SENDER_ID,
                    DEFAULT_RECEIVER_ID,
                    json!({"type": "GET_STATUS"}),
                    &["RECEIVER_STATUS"],
                    Some(Duration::from_secs(10)),
                    None,
                )
            })
        };

        // The device goes silent: no pongs, no anything. The channel must
        // declare the connection lost after the grace window.
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);
        assert!(matches!(waiting.join().unwrap(), Err(Error::ChannelClosed)));
        assert_eq!(channel.state(), ChannelState::Disconnected);

        // With auto reconnect on, the next request dials again. The stale
        // GET_STATUS of the failed request may still sit in the pipe, so the
        // script answers every status request it sees; the stale answer is
        // swallowed by the channel.
        let script = thread::spawn(move || {
            device.accept_connect();
            while let Some(frame) = device.try_next_frame(Duration::from_secs(2)) {
                if frame.namespace != "urn:x-cast:com.google.cast.receiver" {
                    continue;
                }
                let request_id = payload_json(&frame)["requestId"].as_i64().unwrap();
                device.send_json(
                    "urn:x-cast:com.google.cast.receiver",
                    DEFAULT_RECEIVER_ID,
                    DEFAULT_SENDER_ID,
                    json!({"responseType": "RECEIVER_STATUS", "requestId": request_id,
                           "status": {"volume": {}}}),
                );
            }
            device
        });

        let response = channel
            .request(
                "urn:x-cast:com.google.cast.receiver",
                DEFAULT_SENDER_ID,
                DEFAULT_RECEIVER_ID,
                json!({"type": "GET_STATUS"}),
                &["RECEIVER_STATUS"],
                None,
                None,
            )
            .unwrap();
        assert_eq!(response.typ, "RECEIVER_STATUS");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), true);
        script.join().unwrap();
    }

    #[test]
    fn request_ids_are_allocated_monotonically_from_one() {
        let (channel, _device) = test_channel(inline_config());

        let first = channel.shared.request_ids.fetch_add(1, Ordering::Relaxed);
        let second = channel.shared.request_ids.fetch_add(1, Ordering::Relaxed);

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
