//! Typed event dispatch for spontaneous messages and connection lifecycle
//! changes.
//!
//! Listeners are registered with an optional event-type filter and invoked
//! either on the channel worker thread (inline) or on a small worker pool.
//! Inline listeners must not call back into the channel that fired them; the
//! worker may be joined by the very call the listener would make.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use serde_derive::Deserialize;
use serde_json::Value;

use crate::cast::proxies;
use crate::channels::media;
use crate::channels::receiver;

const REPLY_TYPE_RECEIVER_STATUS: &str = "RECEIVER_STATUS";
const REPLY_TYPE_MEDIA_STATUS: &str = "MEDIA_STATUS";
const REPLY_TYPE_LAUNCH_ERROR: &str = "LAUNCH_ERROR";
const REPLY_TYPE_INVALID_REQUEST: &str = "INVALID_REQUEST";
const REPLY_TYPE_LOAD_FAILED: &str = "LOAD_FAILED";
const REPLY_TYPE_LOAD_CANCELLED: &str = "LOAD_CANCELLED";
const REPLY_TYPE_MULTIZONE_STATUS: &str = "MULTIZONE_STATUS";
const REPLY_TYPE_DEVICE_ADDED: &str = "DEVICE_ADDED";
const REPLY_TYPE_DEVICE_UPDATED: &str = "DEVICE_UPDATED";
const REPLY_TYPE_DEVICE_REMOVED: &str = "DEVICE_REMOVED";

const WORKER_POOL_SIZE: usize = 2;

/// How `fire` delivers events to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Listeners run on the thread that fired the event.
    Inline,
    /// Listeners run on a small dedicated thread pool with an unbounded
    /// queue.
    #[default]
    WorkerPool,
}

/// A member of a multizone group, as reported by the device.
#[derive(Deserialize, Debug, Clone)]
pub struct MultizoneDevice {
    #[serde(rename = "deviceId")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub capabilities: Option<u32>,

    #[serde(default)]
    pub volume: Option<receiver::Volume>,
}

/// Spontaneous messages and lifecycle changes surfaced to listeners.
#[derive(Debug, Clone)]
pub enum Event {
    /// The channel became connected (`true`) or disconnected (`false`).
    Connected(bool),
    /// Unsolicited receiver status broadcast.
    ReceiverStatus(receiver::Status),
    /// Unsolicited media status broadcast.
    MediaStatus(Vec<media::Status>),
    /// A launch failed outside of any pending request.
    LaunchError(Option<String>),
    /// The receiver rejected a message outside of any pending request.
    InvalidRequest(Option<String>),
    LoadFailed,
    LoadCancelled(Option<i32>),
    /// The remote end closed a virtual connection this lib has no session
    /// for.
    Close { peer: String },
    MultizoneStatus(Vec<MultizoneDevice>),
    DeviceAdded(MultizoneDevice),
    DeviceUpdated(MultizoneDevice),
    DeviceRemoved { device_id: String },
    /// Catch-all for response types the lib does not interpret. Each
    /// listener receives its own copy of the JSON tree.
    Unknown { typ: String, payload: Value },
}

/// Discriminants of [`Event`], used as listener filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Connected,
    ReceiverStatus,
    MediaStatus,
    LaunchError,
    InvalidRequest,
    LoadFailed,
    LoadCancelled,
    Close,
    MultizoneStatus,
    DeviceAdded,
    DeviceUpdated,
    DeviceRemoved,
    Unknown,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Connected(_) => EventType::Connected,
            Event::ReceiverStatus(_) => EventType::ReceiverStatus,
            Event::MediaStatus(_) => EventType::MediaStatus,
            Event::LaunchError(_) => EventType::LaunchError,
            Event::InvalidRequest(_) => EventType::InvalidRequest,
            Event::LoadFailed => EventType::LoadFailed,
            Event::LoadCancelled(_) => EventType::LoadCancelled,
            Event::Close { .. } => EventType::Close,
            Event::MultizoneStatus(_) => EventType::MultizoneStatus,
            Event::DeviceAdded(_) => EventType::DeviceAdded,
            Event::DeviceUpdated(_) => EventType::DeviceUpdated,
            Event::DeviceRemoved { .. } => EventType::DeviceRemoved,
            Event::Unknown { .. } => EventType::Unknown,
        }
    }

    /// Builds the event for a spontaneous payload, keyed by its
    /// discriminator. Payloads that fail to decode degrade to
    /// [`Event::Unknown`] rather than killing the reader.
    pub(crate) fn from_payload(typ: &str, payload: Value) -> Event {
        let decoded = match typ {
            REPLY_TYPE_RECEIVER_STATUS => {
                serde_json::from_value::<proxies::receiver::StatusReply>(payload.clone())
                    .map(|reply| Event::ReceiverStatus(reply.status.into()))
            }
            REPLY_TYPE_MEDIA_STATUS => {
                serde_json::from_value::<proxies::media::StatusReply>(payload.clone())
                    .map(|reply| Event::MediaStatus(reply.status))
            }
            REPLY_TYPE_LAUNCH_ERROR => {
                serde_json::from_value::<proxies::receiver::LaunchErrorReply>(payload.clone())
                    .map(|reply| Event::LaunchError(reply.reason))
            }
            REPLY_TYPE_INVALID_REQUEST => {
                serde_json::from_value::<proxies::receiver::InvalidRequestReply>(payload.clone())
                    .map(|reply| Event::InvalidRequest(reply.reason))
            }
            REPLY_TYPE_LOAD_FAILED => Ok(Event::LoadFailed),
            REPLY_TYPE_LOAD_CANCELLED => {
                serde_json::from_value::<proxies::media::LoadCancelledReply>(payload.clone())
                    .map(|reply| Event::LoadCancelled(reply.item_id))
            }
            REPLY_TYPE_MULTIZONE_STATUS => {
                serde_json::from_value::<proxies::multizone::StatusReply>(payload.clone())
                    .map(|reply| Event::MultizoneStatus(reply.status.devices))
            }
            REPLY_TYPE_DEVICE_ADDED => {
                serde_json::from_value::<proxies::multizone::DeviceChangeReply>(payload.clone())
                    .map(|reply| Event::DeviceAdded(reply.device))
            }
            REPLY_TYPE_DEVICE_UPDATED => {
                serde_json::from_value::<proxies::multizone::DeviceChangeReply>(payload.clone())
                    .map(|reply| Event::DeviceUpdated(reply.device))
            }
            REPLY_TYPE_DEVICE_REMOVED => {
                serde_json::from_value::<proxies::multizone::DeviceRemovedReply>(payload.clone())
                    .map(|reply| Event::DeviceRemoved {
                        device_id: reply.device_id,
                    })
            }
            _ => {
                return Event::Unknown {
                    typ: typ.to_string(),
                    payload,
                }
            }
        };

        decoded.unwrap_or_else(|err| {
            log::warn!("Failed to decode `{typ}` payload, degrading to Unknown: {err}");
            Event::Unknown {
                typ: typ.to_string(),
                payload,
            }
        })
    }
}

/// Handle returned by [`EventBus::add`], used to unregister the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ListenerFn = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

#[derive(Clone)]
struct Registration {
    id: u64,
    /// Empty set means "all events".
    types: HashSet<EventType>,
    listener: ListenerFn,
}

impl Registration {
    fn wants(&self, event: &Event) -> bool {
        self.types.is_empty() || self.types.contains(&event.event_type())
    }
}

/// Listener list with per-listener event-type filters.
///
/// The list is copy-on-write: `fire` takes an atomic snapshot, so listeners
/// added or removed during dispatch take effect from the next event on.
pub struct EventBus {
    registrations: Mutex<Arc<Vec<Registration>>>,
    next_id: AtomicU64,
    mode: DispatchMode,
    pool: Option<WorkerPool>,
}

impl EventBus {
    pub(crate) fn new(mode: DispatchMode) -> Self {
        let pool = match mode {
            DispatchMode::Inline => None,
            DispatchMode::WorkerPool => Some(WorkerPool::new(WORKER_POOL_SIZE)),
        };

        EventBus {
            registrations: Mutex::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            mode,
            pool,
        }
    }

    /// Registers `listener` for the given event types; an empty `types` slice
    /// subscribes to every event.
    pub fn add<F>(&self, types: &[EventType], listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            types: types.iter().copied().collect(),
            listener: Arc::new(listener),
        };

        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**registrations).clone();
        next.push(registration);
        *registrations = Arc::new(next);

        ListenerId(id)
    }

    /// Removes a previously registered listener. Returns whether it was
    /// still registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = registrations.len();
        let next: Vec<_> = registrations
            .iter()
            .filter(|registration| registration.id != id.0)
            .cloned()
            .collect();
        let removed = next.len() != before;
        *registrations = Arc::new(next);

        removed
    }

    pub fn clear(&self) {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *registrations = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every listener whose filter matches. Each
    /// recipient gets its own clone of the event, so mutable JSON trees in
    /// `Unknown` never cross threads.
    pub(crate) fn fire(&self, event: &Event) {
        let snapshot = Arc::clone(
            &self
                .registrations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        for registration in snapshot.iter().filter(|r| r.wants(event)) {
            let listener = Arc::clone(&registration.listener);
            let event = event.clone();
            match self.mode {
                DispatchMode::Inline => invoke(&listener, &event),
                DispatchMode::WorkerPool => {
                    if let Some(pool) = &self.pool {
                        pool.execute(Box::new(move || invoke(&listener, &event)));
                    }
                }
            }
        }
    }
}

/// Listener faults are contained: a panicking listener is logged and the
/// dispatch (and the reader behind it) carries on.
fn invoke(listener: &ListenerFn, event: &Event) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
        log::warn!("Event listener panicked on {:?} event", event.event_type());
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    jobs: Sender<Job>,
}

impl WorkerPool {
    /// Worker threads are detached; they exit once the bus (and with it the
    /// sending side of the queue) is dropped.
    fn new(size: usize) -> Self {
        let (jobs, queue) = unbounded::<Job>();

        for index in 0..size {
            let queue = queue.clone();
            thread::Builder::new()
                .name(format!("cast-event-{index}"))
                .spawn(move || {
                    while let Ok(job) = queue.recv() {
                        job();
                    }
                })
                .expect("failed to spawn event dispatch thread");
        }

        WorkerPool { jobs }
    }

    fn execute(&self, job: Job) {
        let _ = self.jobs.send(job);
    }
}
