use crate::collection::Collection;
use crate::context::{CancelHandle, Context};
use crate::driver::{ChangeEvent, ChangeStreamOptions, OperationType, RawChangeStream, ResumeToken};
use crate::errors::{is_stop, ErrorKind, KilnError, KilnResult};
use crate::id::ID;
use crate::iterator::decode_model;
use crate::model::{Meta, Model, LOCK_FIELD};
use crate::store::Store;
use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default pause between two attempts to reopen a failed feed.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Options of a [`ChangeStream`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    retry_delay: Duration,
    token: Option<ResumeToken>,
}

impl StreamOptions {
    pub fn new() -> Self {
        StreamOptions {
            retry_delay: DEFAULT_RETRY_DELAY,
            token: None,
        }
    }

    /// Sets the pause between two attempts to reopen the feed.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Resumes the stream after the change identified by the token.
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions::new()
    }
}

/// The kind of a stream [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The feed has been established for the first time. Once the receiver
    /// accepted it, later reconnects are reported as `Resumed`.
    Opened,
    /// The feed has been established again after an error.
    Resumed,
    /// A document has been inserted.
    Created,
    /// A document has been updated or replaced.
    Updated,
    /// A document has been deleted.
    Deleted,
    /// The feed or the receiver failed. The stream retries unless the
    /// receiver returns [`KilnError::stop`].
    Errored,
    /// The stream has ended.
    Stopped,
}

/// An event delivered to the receiver of a [`ChangeStream`].
///
/// `id` is set for document events, `model` for `Created` and `Updated`,
/// `error` for `Errored`. `token` is the resume token of the change, or the
/// last saved token for the lifecycle events.
#[derive(Debug)]
pub struct Event<M> {
    pub kind: EventKind,
    pub id: Option<ID>,
    pub model: Option<M>,
    pub error: Option<KilnError>,
    pub token: Option<ResumeToken>,
}

impl<M> Event<M> {
    fn signal(kind: EventKind, token: Option<ResumeToken>) -> Self {
        Event {
            kind,
            id: None,
            model: None,
            error: None,
            token,
        }
    }
}

/// The state of a [`ChangeStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Closed = 0,
    Opening = 1,
    Tailing = 2,
    Erroring = 3,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Opening,
            2 => StreamState::Tailing,
            3 => StreamState::Erroring,
            _ => StreamState::Closed,
        }
    }
}

/// State shared between a stream handle and its worker thread.
struct Shared {
    name: &'static str,
    state: AtomicU8,
    token: Mutex<Option<ResumeToken>>,
    closing: Mutex<bool>,
    signal: Condvar,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn token(&self) -> Option<ResumeToken> {
        self.token.lock().clone()
    }

    fn set_token(&self, token: Option<ResumeToken>) {
        *self.token.lock() = token;
    }

    fn is_closing(&self) -> bool {
        *self.closing.lock()
    }

    /// Waits for the delay or until the stream is closed. Returns whether
    /// the stream is closing.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut closing = self.closing.lock();
        while !*closing {
            if self.signal.wait_until(&mut closing, deadline).timed_out() {
                break;
            }
        }
        *closing
    }
}

/// Continuously forwards the changes of a model's collection to a receiver.
///
/// # Purpose
/// A change stream tails the change feed of a collection on a background
/// thread and turns raw changes into model events. It keeps the resume token
/// of the last delivered change, or of the start of the feed before any
/// change was delivered, and reopens the feed from it whenever the feed or
/// the receiver fails, so no change is lost across reconnects. A change may
/// be delivered again if the receiver failed on it.
///
/// # Characteristics
/// - Updates that only increment the lock counter are skipped.
/// - Dropping or renaming the collection or dropping the database
///   invalidates the stream. The receiver gets an `Errored` event with an
///   `Invalidated` error; unless it stops the stream, the stream restarts
///   from the current end of the feed and the changes in between are lost.
/// - The receiver stops the stream by returning [`KilnError::stop`].
/// - Persisting the token across processes is up to the receiver; reopen
///   with [`StreamOptions::resume_after`] to continue.
///
/// # Examples
///
/// ```rust,ignore
/// let stream = ChangeStream::open(&store, StreamOptions::new(), |event: Event<Post>| {
///     if event.kind == EventKind::Created {
///         println!("created {:?}", event.id);
///     }
///     Ok(())
/// })?;
/// // ...
/// stream.close();
/// ```
pub struct ChangeStream {
    shared: Arc<Shared>,
    cancel: CancelHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeStream {
    /// Opens a stream on the collection of `M` and starts forwarding events
    /// to the receiver.
    pub fn open<M, F>(store: &Store, options: StreamOptions, receiver: F) -> KilnResult<ChangeStream>
    where
        M: Model,
        F: FnMut(Event<M>) -> KilnResult<()> + Send + 'static,
    {
        if store.is_closed() {
            return Err(KilnError::new("store has been closed", ErrorKind::StoreAlreadyClosed));
        }

        let meta = M::meta();
        let shared = Arc::new(Shared {
            name: meta.collection(),
            state: AtomicU8::new(StreamState::Opening as u8),
            token: Mutex::new(options.token),
            closing: Mutex::new(false),
            signal: Condvar::new(),
        });
        let (ctx, cancel) = Context::background().with_cancel();

        let worker = Worker {
            collection: store.c::<M>(),
            meta,
            ctx,
            shared: shared.clone(),
            receiver,
            retry_delay: options.retry_delay,
            opened: false,
            _marker: PhantomData,
        };

        let handle = std::thread::Builder::new()
            .name(format!("kiln-stream-{}", meta.collection()))
            .spawn(move || worker.run())
            .map_err(|err| {
                KilnError::new(
                    &format!("failed to start change stream: {}", err),
                    ErrorKind::InternalError,
                )
            })?;

        info!("Opened change stream on {}", meta.collection());
        Ok(ChangeStream {
            shared,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// The resume token the stream would reopen from: the last delivered or
    /// skipped change, or the position the stream has tailed up to.
    pub fn token(&self) -> Option<ResumeToken> {
        self.shared.token()
    }

    /// Closes the stream and waits for the worker thread to exit. Closing
    /// twice is a no-op. Called from within the receiver, the stream is
    /// closed once the receiver returns.
    pub fn close(&self) {
        {
            let mut closing = self.shared.closing.lock();
            *closing = true;
        }
        self.shared.signal.notify_all();
        self.cancel.cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("Change stream worker of {} panicked", self.shared.name);
                self.shared.set_state(StreamState::Closed);
            }
        }
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for ChangeStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("collection", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Returns whether an update only incremented the lock counter.
fn is_lock_only(change: &ChangeEvent) -> bool {
    match &change.update_description {
        Some(description) => {
            description.removed_fields.is_empty()
                && description.updated_fields.len() == 1
                && description.updated_fields.contains_key(LOCK_FIELD)
        }
        None => false,
    }
}

struct Worker<M, F> {
    collection: Collection,
    meta: &'static Meta,
    ctx: Context,
    shared: Arc<Shared>,
    receiver: F,
    retry_delay: Duration,
    opened: bool,
    _marker: PhantomData<fn() -> M>,
}

impl<M, F> Worker<M, F>
where
    M: Model,
    F: FnMut(Event<M>) -> KilnResult<()> + Send + 'static,
{
    fn run(mut self) {
        loop {
            if self.shared.is_closing() {
                break;
            }

            let err = match self.tail() {
                Ok(()) => continue,
                Err(err) => err,
            };
            if is_stop(&err) || self.shared.is_closing() {
                break;
            }

            self.shared.set_state(StreamState::Erroring);
            warn!("Change stream on {} failed: {}", self.meta.collection(), err);
            if err.kind() == &ErrorKind::Invalidated {
                self.shared.set_token(None);
            }

            let event = Event {
                error: Some(err),
                ..Event::signal(EventKind::Errored, self.shared.token())
            };
            if let Err(err) = (self.receiver)(event) {
                if is_stop(&err) {
                    break;
                }
                warn!("Receiver of {} failed on error: {}", self.meta.collection(), err);
            }

            if self.shared.pause(self.retry_delay) {
                break;
            }
        }

        self.shared.set_state(StreamState::Closed);
        let token = self.shared.token();
        if let Err(err) = (self.receiver)(Event::signal(EventKind::Stopped, token)) {
            if !is_stop(&err) {
                warn!("Receiver of {} failed on stop: {}", self.meta.collection(), err);
            }
        }
        info!("Stopped change stream on {}", self.meta.collection());
    }

    /// Opens the feed and forwards its changes until it ends or fails.
    fn tail(&mut self) -> KilnResult<()> {
        self.shared.set_state(StreamState::Opening);
        let options = ChangeStreamOptions {
            resume_after: self.shared.token(),
            full_document_lookup: true,
        };

        let mut feed = self.collection.watch(&self.ctx, options)?;
        if self.shared.token().is_none() {
            self.shared.set_token(feed.resume_token());
        }
        let result = self.forward(feed.as_mut());
        if let Err(err) = feed.close() {
            warn!("Failed to close change feed of {}: {}", self.meta.collection(), err);
        }
        result
    }

    fn forward(&mut self, feed: &mut dyn RawChangeStream) -> KilnResult<()> {
        let kind = if self.opened {
            EventKind::Resumed
        } else {
            EventKind::Opened
        };
        (self.receiver)(Event::signal(kind, self.shared.token()))?;
        if self.opened {
            info!("Resumed change stream on {}", self.meta.collection());
        }
        self.opened = true;
        self.shared.set_state(StreamState::Tailing);

        loop {
            let change = match feed.try_next(&self.ctx)? {
                Some(change) => change,
                None if feed.is_ended() => return Ok(()),
                None => {
                    // Quiet polls still move past changes of other collections.
                    if let Some(token) = feed.resume_token() {
                        self.shared.set_token(Some(token));
                    }
                    continue;
                }
            };

            let kind = match change.operation {
                OperationType::Insert => EventKind::Created,
                OperationType::Update | OperationType::Replace => EventKind::Updated,
                OperationType::Delete => EventKind::Deleted,
                ref operation => {
                    return Err(KilnError::new(
                        &format!(
                            "change stream on {} invalidated by {}",
                            self.meta.collection(),
                            operation.name()
                        ),
                        ErrorKind::Invalidated,
                    ))
                }
            };

            let model = if kind == EventKind::Deleted {
                None
            } else {
                match change.full_document.clone() {
                    Some(doc) if !doc.is_empty() && !is_lock_only(&change) => Some(decode_model::<M>(doc, false)?),
                    _ => {
                        self.shared.set_token(Some(change.token));
                        continue;
                    }
                }
            };

            let id = match change.document_key {
                Some(key) => Some(serde_json::from_value::<ID>(key)?),
                None => None,
            };

            (self.receiver)(Event {
                kind,
                id,
                model,
                error: None,
                token: Some(change.token.clone()),
            })?;
            self.shared.set_token(Some(change.token));
        }
    }
}
