//! Bounded, typed, cross-process FIFO channels.
//!
//! A channel is a shared memory ring created by the orchestrator
//! ([`BoundedChannel`]) and opened by workers through a [`PortRef`]
//! ([`ChannelHandle`]). Messages are postcard-encoded into fixed-size frames.
//!
//! Blocking calls never block forever unless asked to with
//! [`Timeout::Infinite`]: `put` reports [`ChannelError::Full`] and `get`
//! reports [`ChannelError::Empty`] when the timeout elapses.
//!
//! # Drain protocol
//!
//! [`BoundedChannel::drain_and_unblock`] marks the channel drained and
//! discards everything queued. While drained, `put` fails immediately with
//! `Full` and `get` fails immediately with `Empty`, so any process parked
//! in either call is released within one backoff step and nothing can
//! reappear in the channel. Producers that were mid-push when the flag went
//! up are waited for (bounded by the drain grace period) and swept.
//! [`BoundedChannel::reopen`] lifts the drained state for another run.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::ipc::backoff::{Backoff, Deadline, Timeout};
use crate::ipc::ring::{AttachError, INIT_TIMEOUT, Ring, RingLayout};
use crate::ipc::shmem::{Creator, Opener, ShmError, ShmMode, ShmPath, ShmRegion};
use crate::trace::{debug, trace, warn};
use crate::wire::{self, DEFAULT_FRAME_CAPACITY, FrameError, Message, MessageType};

/// Slots allocated for a channel created with capacity `<= 0`.
pub const DEFAULT_UNBOUNDED_CAPACITY: usize = 1024;

/// How long a drain waits for producers caught mid-push.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Errors from channel construction and operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// No space freed up before the timeout, or the channel is drained.
    #[error("channel full")]
    Full,
    /// No message arrived before the timeout, or the channel is drained.
    #[error("channel empty")]
    Empty,
    /// The message could not be encoded into a frame.
    #[error("failed to encode message: {0}")]
    Encode(#[source] FrameError),
    /// A frame could not be decoded as the channel's message type.
    #[error("failed to decode message: {0}")]
    Decode(#[source] FrameError),
    /// A handle was opened with a different message type than the channel's.
    #[error("channel `{channel}` carries {expected}, not {requested}")]
    TypeMismatch {
        channel: String,
        expected: String,
        requested: String,
    },
    /// The shared ring could not be attached.
    #[error("channel `{channel}` unusable: {reason}")]
    Attach { channel: String, reason: String },
    /// Frame size or capacity produced an impossible layout.
    #[error("channel `{channel}` has an invalid layout (capacity {capacity}, frame {frame_capacity} bytes)")]
    InvalidLayout {
        channel: String,
        capacity: usize,
        frame_capacity: usize,
    },
    /// Shared memory failure.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
}

/// Construction-time settings shared by every channel of a pipeline.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Payload bytes per frame; larger messages are rejected.
    pub frame_capacity: usize,
    /// Slots backing a channel requested with capacity `<= 0`.
    pub unbounded_capacity: usize,
    /// How long a drain waits for producers caught mid-push.
    pub drain_grace: Duration,
    /// Prefix of the shared memory object names.
    pub shm_prefix: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            unbounded_capacity: DEFAULT_UNBOUNDED_CAPACITY,
            drain_grace: DEFAULT_DRAIN_GRACE,
            shm_prefix: "flightdeck".to_string(),
        }
    }
}

/// Untyped, cloneable reference to a channel.
///
/// This is what a [`WorkerSpec`](crate::worker::WorkerSpec) binds to its
/// ports; it carries everything needed to open a [`ChannelHandle`] in
/// another process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    name: Arc<str>,
    path: ShmPath,
    message: MessageType,
    layout: (usize, usize),
}

impl PortRef {
    /// Channel name given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared memory object backing the channel.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    /// Message type carried by the channel.
    #[must_use]
    pub fn message(&self) -> MessageType {
        self.message
    }

    fn ring_layout(&self) -> Option<RingLayout> {
        RingLayout::new(self.layout.0, self.layout.1)
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.message.name())
    }
}

/// Mapping plus ring view; the ring points into the region.
struct Endpoint<M: ShmMode> {
    ring: Ring,
    _region: ShmRegion<M>,
}

enum PutAttempt {
    Sent,
    Full,
    Drained,
}

impl<M: ShmMode> Endpoint<M> {
    fn try_put_bytes(&self, bytes: &[u8]) -> PutAttempt {
        let state = self.ring.state();
        // Announce the push before checking the flag; the drain waits for
        // `inflight` to reach zero after raising the flag.
        state.inflight.fetch_add(1, Ordering::SeqCst);
        let attempt = if state.drained.load(Ordering::SeqCst) {
            PutAttempt::Drained
        } else if self.ring.push(bytes) {
            PutAttempt::Sent
        } else {
            PutAttempt::Full
        };
        state.inflight.fetch_sub(1, Ordering::SeqCst);
        attempt
    }

    fn put<T: Message>(&self, item: &T, timeout: Timeout) -> Result<(), ChannelError> {
        let bytes = wire::encode(item, self.ring.frame_capacity()).map_err(ChannelError::Encode)?;
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new();
        loop {
            match self.try_put_bytes(&bytes) {
                PutAttempt::Sent => return Ok(()),
                PutAttempt::Drained => {
                    trace!("put refused; channel drained");
                    return Err(ChannelError::Full);
                }
                PutAttempt::Full if deadline.expired() => return Err(ChannelError::Full),
                PutAttempt::Full => backoff.snooze(&deadline),
            }
        }
    }

    fn try_get<T: Message>(&self) -> Result<T, ChannelError> {
        if self.is_drained() {
            return Err(ChannelError::Empty);
        }
        match self.ring.pop_with(wire::decode::<T>) {
            Some(result) => result.map_err(ChannelError::Decode),
            None => Err(ChannelError::Empty),
        }
    }

    fn get<T: Message>(&self, timeout: Timeout) -> Result<T, ChannelError> {
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new();
        loop {
            match self.try_get() {
                Err(ChannelError::Empty) if !self.is_drained() && !deadline.expired() => {
                    backoff.snooze(&deadline);
                }
                other => return other,
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.ring.state().drained.load(Ordering::Acquire)
    }
}

/// Orchestrator-owned channel carrying messages of type `T`.
///
/// Cloning shares the same underlying channel. The shared memory name is
/// unlinked when the last clone is dropped.
pub struct BoundedChannel<T: Message> {
    inner: Arc<Owned>,
    _marker: PhantomData<fn() -> T>,
}

struct Owned {
    endpoint: Endpoint<Creator>,
    port: PortRef,
    requested_capacity: i64,
    drain_grace: Duration,
}

impl<T: Message> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: Message> BoundedChannel<T> {
    /// Creates a channel named `name` holding at most `capacity` messages.
    ///
    /// A `capacity <= 0` means unbounded: the channel is backed by
    /// `options.unbounded_capacity` slots and `put` only ever waits if that
    /// many messages pile up.
    ///
    /// # Errors
    ///
    /// Fails if the layout is impossible or shared memory cannot be created.
    pub fn create(name: &str, capacity: i64, options: &ChannelOptions) -> Result<Self, ChannelError> {
        let slots = if capacity <= 0 {
            options.unbounded_capacity
        } else {
            usize::try_from(capacity).unwrap_or(usize::MAX)
        };
        let layout = RingLayout::new(slots, options.frame_capacity).ok_or_else(|| {
            ChannelError::InvalidLayout {
                channel: name.to_string(),
                capacity: slots,
                frame_capacity: options.frame_capacity,
            }
        })?;

        let message = MessageType::of::<T>();
        let path = ShmPath::unique(&options.shm_prefix, name)?;
        let mut ring = None;
        let region = ShmRegion::create(path.clone(), layout.region_len(), |base, _| {
            // SAFETY: freshly mapped, page aligned, sized by the layout and
            // not yet shared with anyone.
            ring = Some(unsafe { Ring::init(base, layout, message.hash()) });
        })?;
        let ring = ring.ok_or_else(|| ChannelError::Attach {
            channel: name.to_string(),
            reason: "ring initialization did not run".to_string(),
        })?;

        debug!(
            channel = name,
            path = %path,
            message = message.name(),
            capacity,
            slots,
            frame_capacity = options.frame_capacity,
            "channel created"
        );

        Ok(Self {
            inner: Arc::new(Owned {
                endpoint: Endpoint {
                    ring,
                    _region: region,
                },
                port: PortRef {
                    name: Arc::from(name),
                    path,
                    message,
                    layout: (layout.capacity, layout.frame_capacity),
                },
                requested_capacity: capacity,
                drain_grace: options.drain_grace,
            }),
            _marker: PhantomData,
        })
    }

    /// Enqueues `item`, waiting up to `timeout` for space.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Full`] on timeout or while drained,
    /// [`ChannelError::Encode`] if `item` does not fit in a frame.
    pub fn put(&self, item: &T, timeout: impl Into<Timeout>) -> Result<(), ChannelError> {
        self.inner.endpoint.put(item, timeout.into())
    }

    /// Enqueues `item` only if space is available right now.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put) with a zero timeout.
    pub fn try_put(&self, item: &T) -> Result<(), ChannelError> {
        self.inner.endpoint.put(item, Timeout::Duration(Duration::ZERO))
    }

    /// Dequeues the oldest message, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Empty`] on timeout or while drained,
    /// [`ChannelError::Decode`] for a corrupt frame.
    pub fn get(&self, timeout: impl Into<Timeout>) -> Result<T, ChannelError> {
        self.inner.endpoint.get(timeout.into())
    }

    /// Dequeues the oldest message if one is queued.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get) with a zero timeout.
    pub fn try_get(&self) -> Result<T, ChannelError> {
        self.inner.endpoint.try_get()
    }

    /// Discards every queued message and releases parked callers.
    ///
    /// The channel stays drained until [`reopen`](Self::reopen). Returns the
    /// number of messages discarded. Never fails.
    pub fn drain_and_unblock(&self) -> usize {
        let owned = &self.inner;
        let ring = &owned.endpoint.ring;
        let state = ring.state();
        state.drained.store(true, Ordering::SeqCst);

        let deadline = Deadline::after(owned.drain_grace.into());
        let mut backoff = Backoff::new();
        let mut discarded = 0;
        loop {
            while ring.discard() {
                discarded += 1;
            }
            if state.inflight.load(Ordering::SeqCst) == 0 {
                while ring.discard() {
                    discarded += 1;
                }
                break;
            }
            if deadline.expired() {
                warn!(
                    channel = owned.port.name(),
                    inflight = state.inflight.load(Ordering::SeqCst),
                    "producers still mid-push after drain grace period"
                );
                break;
            }
            backoff.snooze(&deadline);
        }

        debug!(channel = owned.port.name(), discarded, "channel drained");
        discarded
    }

    /// Lifts the drained state so the channel carries messages again.
    pub fn reopen(&self) {
        self.inner
            .endpoint
            .ring
            .state()
            .drained
            .store(false, Ordering::SeqCst);
    }

    /// Whether the channel is currently drained.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.endpoint.is_drained()
    }

    /// Approximate number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.endpoint.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots backing the channel.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.endpoint.ring.capacity()
    }

    /// Whether the channel was created with capacity `<= 0`.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.inner.requested_capacity <= 0
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.port.name()
    }

    /// Untyped reference for wiring the channel into a worker.
    #[must_use]
    pub fn port(&self) -> PortRef {
        self.inner.port.clone()
    }

    /// Opens a non-owning handle in this process.
    ///
    /// # Errors
    ///
    /// Fails if the shared memory object cannot be mapped again.
    pub fn handle(&self) -> Result<ChannelHandle<T>, ChannelError> {
        ChannelHandle::open(&self.inner.port)
    }
}

impl<T: Message> fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("port", &self.inner.port)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Type-erased control surface the orchestrator keeps for every channel.
pub trait ChannelControl: Send + Sync {
    fn port(&self) -> PortRef;
    fn drain_and_unblock(&self) -> usize;
    fn reopen(&self);
    fn len(&self) -> usize;
}

impl<T: Message> ChannelControl for BoundedChannel<T> {
    fn port(&self) -> PortRef {
        BoundedChannel::port(self)
    }

    fn drain_and_unblock(&self) -> usize {
        BoundedChannel::drain_and_unblock(self)
    }

    fn reopen(&self) {
        BoundedChannel::reopen(self);
    }

    fn len(&self) -> usize {
        BoundedChannel::len(self)
    }
}

/// Type-erased, non-owning endpoint of a channel.
///
/// Workers receive their ports in this form and recover the typed
/// [`ChannelHandle`] with [`typed`](Self::typed).
#[derive(Clone)]
pub struct AnyHandle {
    port: PortRef,
    endpoint: Arc<Endpoint<Opener>>,
}

impl AnyHandle {
    /// Maps the channel described by `port` into this process.
    ///
    /// # Errors
    ///
    /// A shared memory or attach error, or [`ChannelError::TypeMismatch`] if
    /// the ring was created for a different message type than `port` claims.
    pub fn open(port: &PortRef) -> Result<Self, ChannelError> {
        let layout = port.ring_layout().ok_or_else(|| ChannelError::InvalidLayout {
            channel: port.name().to_string(),
            capacity: port.layout.0,
            frame_capacity: port.layout.1,
        })?;
        let region = ShmRegion::open(port.path.clone(), layout.region_len())?;
        // SAFETY: the region stays mapped inside the endpoint next to the view.
        let ring = unsafe { Ring::attach(region.as_ptr(), region.len(), INIT_TIMEOUT) }
            .map_err(|err| attach_error(port.name(), err))?;

        if ring.type_hash() != port.message.hash() {
            return Err(ChannelError::TypeMismatch {
                channel: port.name().to_string(),
                expected: format!("{:016x}", ring.type_hash()),
                requested: port.message.to_string(),
            });
        }

        Ok(Self {
            port: port.clone(),
            endpoint: Arc::new(Endpoint {
                ring,
                _region: region,
            }),
        })
    }

    #[must_use]
    pub fn port(&self) -> &PortRef {
        &self.port
    }

    /// Recovers the typed handle.
    ///
    /// # Errors
    ///
    /// [`ChannelError::TypeMismatch`] if `T` is not the channel's message type.
    pub fn typed<T: Message>(&self) -> Result<ChannelHandle<T>, ChannelError> {
        let requested = MessageType::of::<T>();
        if requested.hash() != self.port.message.hash() {
            return Err(ChannelError::TypeMismatch {
                channel: self.port.name().to_string(),
                expected: self.port.message.to_string(),
                requested: requested.to_string(),
            });
        }
        Ok(ChannelHandle {
            raw: self.clone(),
            _marker: PhantomData,
        })
    }
}

impl fmt::Debug for AnyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyHandle").field("port", &self.port).finish()
    }
}

/// Worker-side, non-owning endpoint of a channel.
///
/// Can put and get; cannot drain. Dropping a handle never removes the
/// channel.
pub struct ChannelHandle<T: Message> {
    raw: AnyHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message> Clone for ChannelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Message> ChannelHandle<T> {
    /// Opens the channel described by `port`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::TypeMismatch`] if `T` is not the channel's message
    /// type, or a shared memory / attach error.
    pub fn open(port: &PortRef) -> Result<Self, ChannelError> {
        let requested = MessageType::of::<T>();
        if requested.hash() != port.message.hash() {
            return Err(ChannelError::TypeMismatch {
                channel: port.name().to_string(),
                expected: port.message.to_string(),
                requested: requested.to_string(),
            });
        }
        AnyHandle::open(port)?.typed()
    }

    /// See [`BoundedChannel::put`].
    ///
    /// # Errors
    ///
    /// [`ChannelError::Full`] on timeout or while drained.
    pub fn put(&self, item: &T, timeout: impl Into<Timeout>) -> Result<(), ChannelError> {
        self.raw.endpoint.put(item, timeout.into())
    }

    /// See [`BoundedChannel::try_put`].
    ///
    /// # Errors
    ///
    /// [`ChannelError::Full`] if no slot is free.
    pub fn try_put(&self, item: &T) -> Result<(), ChannelError> {
        self.raw.endpoint.put(item, Timeout::Duration(Duration::ZERO))
    }

    /// See [`BoundedChannel::get`].
    ///
    /// # Errors
    ///
    /// [`ChannelError::Empty`] on timeout or while drained.
    pub fn get(&self, timeout: impl Into<Timeout>) -> Result<T, ChannelError> {
        self.raw.endpoint.get(timeout.into())
    }

    /// See [`BoundedChannel::try_get`].
    ///
    /// # Errors
    ///
    /// [`ChannelError::Empty`] if nothing is queued.
    pub fn try_get(&self) -> Result<T, ChannelError> {
        self.raw.endpoint.try_get()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.raw.port.name()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.raw.endpoint.ring.capacity()
    }
}

impl<T: Message> fmt::Debug for ChannelHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn attach_error(channel: &str, err: AttachError) -> ChannelError {
    let reason = match err {
        AttachError::NotInitialized => "ring was never initialized".to_string(),
        AttachError::VersionMismatch(v) => format!("unsupported ring layout version {v}"),
        AttachError::Truncated { needed, actual } => {
            format!("region holds {actual} bytes, ring needs {needed}")
        }
    };
    ChannelError::Attach {
        channel: channel.to_string(),
        reason,
    }
}
