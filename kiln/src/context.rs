use crate::driver::Session;
use crate::errors::{ErrorKind, KilnError, KilnResult};
use smallvec::SmallVec;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Marks a context as running inside a transaction.
///
/// The marker is a typed token rather than an untyped context value, so it
/// cannot collide with anything else a caller stores alongside a context. It
/// holds the driver session the transaction runs in; every driver call made
/// with a marked context joins that transaction.
#[derive(Clone)]
pub struct TransactionMarker {
    session: Arc<dyn Session>,
}

impl TransactionMarker {
    pub(crate) fn new(session: Arc<dyn Session>) -> Self {
        TransactionMarker { session }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

/// A cancellation and deadline bearing operation context.
///
/// Every store, manager and driver operation takes a `&Context`. Contexts are
/// cheap to clone; derived contexts inherit the cancellation flags and the
/// deadline of their parent, so cancelling a parent cancels all of its
/// descendants.
///
/// # Examples
///
/// ```rust
/// use kiln::context::Context;
/// use std::time::Duration;
///
/// let (ctx, cancel) = Context::background().with_cancel();
/// let child = ctx.with_timeout(Duration::from_secs(5));
/// assert!(child.check().is_ok());
///
/// cancel.cancel();
/// assert!(child.check().is_err());
/// ```
#[derive(Clone, Default)]
pub struct Context {
    cancels: SmallVec<[Arc<AtomicBool>; 2]>,
    deadline: Option<Instant>,
    transaction: Option<TransactionMarker>,
}

/// Cancels the context it was created with.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Context {
    /// Returns an empty context without cancellation, deadline or
    /// transaction.
    pub fn background() -> Self {
        Context::default()
    }

    /// Returns a derived context and a handle that cancels it.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ctx = self.clone();
        ctx.cancels.push(flag.clone());
        (ctx, CancelHandle { flag })
    }

    /// Returns a derived context that expires after the timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a derived context that expires at the deadline. An earlier
    /// deadline of the parent is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let mut ctx = self.clone();
        ctx.deadline = match self.deadline {
            Some(existing) if existing < deadline => Some(existing),
            _ => Some(deadline),
        };
        ctx
    }

    pub(crate) fn with_transaction(&self, marker: TransactionMarker) -> Context {
        let mut ctx = self.clone();
        ctx.transaction = Some(marker);
        ctx
    }

    /// Returns an error if the context has been cancelled or its deadline has
    /// passed.
    pub fn check(&self) -> KilnResult<()> {
        if self.cancels.iter().any(|flag| flag.load(Ordering::SeqCst)) {
            return Err(KilnError::new("context cancelled", ErrorKind::Cancelled));
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(KilnError::new(
                    "context deadline exceeded",
                    ErrorKind::DeadlineExceeded,
                ));
            }
        }

        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left until the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns whether the context carries a transaction.
    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction(&self) -> Option<&TransactionMarker> {
        self.transaction.as_ref()
    }

    /// Returns the session of the carried transaction.
    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.transaction.as_ref().map(|marker| marker.session())
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancellable", &!self.cancels.is_empty())
            .field("deadline", &self.deadline)
            .field("transaction", &self.has_transaction())
            .finish()
    }
}
