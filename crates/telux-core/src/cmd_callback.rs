//! Correlation of asynchronous commands with their pending callbacks
//!
//! A request is tagged with a [`CommandId`] obtained from
//! [`CommandCallbackManager::register_weak`] or [`CommandCallbackManager::register_strong`].
//! The id travels with the request through the transport. When the response carrying
//! the same id comes back, [`CommandCallbackManager::take`] hands the callback back
//! exactly once and forgets about it.

use core::fmt;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use as_any::AsAny;

/// Correlation token passed to the transport together with a request
pub type CommandId = i32;

/// Used in place of a command id when the caller did not supply a callback
pub const INVALID_COMMAND_ID: CommandId = -1;

/// Counter value on construction and after reset, so the first id handed out is 1
const INITIAL_COUNTER: CommandId = 0;

/// Base trait for callback objects supplied by the application.
/// The registry only ever holds these weakly; the application owns them.
pub trait CommandCallback: Send + Sync + AsAny {}

/// A callback retrieved from the registry
pub enum PendingCallback<L: ?Sized = dyn CommandCallback> {
    /// Callback object, resolved to a strong handle at retrieval time
    Object(Arc<L>),
    /// Strongly owned closure (or any other value) stored with `register_strong`
    Closure(Box<dyn Any + Send>),
}

impl<L: ?Sized> PendingCallback<L> {
    pub fn into_object(self) -> Option<Arc<L>> {
        match self {
            PendingCallback::Object(obj) => Some(obj),
            PendingCallback::Closure(_) => None,
        }
    }

    /// Recovers the closure if it was registered with type `F`
    pub fn into_closure<F: Any>(self) -> Option<F> {
        match self {
            PendingCallback::Closure(boxed) => boxed.downcast::<F>().ok().map(|f| *f),
            PendingCallback::Object(_) => None,
        }
    }
}

impl<L: ?Sized> fmt::Debug for PendingCallback<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingCallback::Object(_) => write!(f, "PendingCallback::Object"),
            PendingCallback::Closure(_) => write!(f, "PendingCallback::Closure"),
        }
    }
}

/// One outstanding request. Both ownership modes share a single map, so an id
/// can never be pending twice.
enum Entry<L: ?Sized> {
    Weak(Weak<L>),
    Strong(Box<dyn Any + Send>),
}

struct Registry<L: ?Sized> {
    counter: CommandId,
    pending: HashMap<CommandId, Entry<L>>,
}

impl<L: ?Sized> Registry<L> {
    fn new() -> Self {
        Self {
            counter: INITIAL_COUNTER,
            pending: HashMap::new(),
        }
    }

    /// Returns the next free command id. Never 0, never INVALID_COMMAND_ID.
    fn next_id(&mut self) -> CommandId {
        loop {
            let mut id = self.counter.wrapping_add(1);
            if id == INVALID_COMMAND_ID || id == 0 {
                id = id.wrapping_add(1);
            }
            // take() rejects negative ids, so once the counter wraps it starts over at 1
            if id < 0 {
                id = INITIAL_COUNTER + 1;
            }
            self.counter = id;

            if !self.pending.contains_key(&id) {
                return id;
            }
            tracing::warn!("command id {} still outstanding after counter wrap, skipping", id);
        }
    }

    fn insert(&mut self, entry: Entry<L>) -> CommandId {
        let cmd_id = self.next_id();
        self.pending.insert(cmd_id, entry);
        cmd_id
    }
}

/// Registry of callbacks waiting for the response to an asynchronous command.
///
/// `L` is the callback object type stored by [`register_weak`](Self::register_weak),
/// usually a trait object. All operations are synchronous and only hold an
/// internal mutex for the duration of a map update, so a single instance can be
/// shared between request-issuing threads and response-delivery threads.
pub struct CommandCallbackManager<L: ?Sized = dyn CommandCallback> {
    registry: Mutex<Registry<L>>,
}

impl<L: ?Sized> Default for CommandCallbackManager<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> CommandCallbackManager<L> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
        }
    }

    /// Every critical section leaves the registry consistent, so a poisoned
    /// lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Registry<L>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a weak reference to a callback object and returns the id to send along
    /// with the request. The registry does not keep the object alive.
    pub fn register_weak(&self, callback: Weak<L>) -> CommandId {
        let cmd_id = self.lock().insert(Entry::Weak(callback));
        tracing::trace!("register_weak: cmd_id {}", cmd_id);
        cmd_id
    }

    /// Stores a closure (or any other owned value) until its response arrives
    pub fn register_strong<F: Any + Send>(&self, callback: F) -> CommandId {
        let cmd_id = self.lock().insert(Entry::Strong(Box::new(callback)));
        tracing::trace!("register_strong: cmd_id {}", cmd_id);
        cmd_id
    }

    /// Removes and returns the callback registered under `cmd_id`.
    ///
    /// Returns None for negative ids, ids that were never registered or were already
    /// taken, and for callback objects whose owners have all been dropped. In the last
    /// case the entry is removed all the same.
    pub fn take(&self, cmd_id: CommandId) -> Option<PendingCallback<L>> {
        if cmd_id < 0 {
            tracing::trace!("take: ignoring cmd_id {}", cmd_id);
            return None;
        }

        let entry = self.lock().pending.remove(&cmd_id);
        match entry {
            Some(Entry::Weak(weak)) => match weak.upgrade() {
                Some(obj) => Some(PendingCallback::Object(obj)),
                None => {
                    tracing::debug!("take: callback object for cmd_id {} no longer exists", cmd_id);
                    None
                }
            },
            Some(Entry::Strong(closure)) => Some(PendingCallback::Closure(closure)),
            None => {
                tracing::trace!("take: no pending callback for cmd_id {}", cmd_id);
                None
            }
        }
    }

    /// Like [`take`](Self::take), for callers that only register callback objects
    pub fn take_object(&self, cmd_id: CommandId) -> Option<Arc<L>> {
        self.take(cmd_id)?.into_object()
    }

    /// Like [`take`](Self::take), recovering a closure registered with type `F`.
    /// An entry of any other type is removed and dropped.
    pub fn take_closure<F: Any>(&self, cmd_id: CommandId) -> Option<F> {
        let callback = self.take(cmd_id)?;
        let closure = callback.into_closure::<F>();
        crate::assert_warn!(closure.is_some(), "callback for cmd_id {} has unexpected type", cmd_id);
        closure
    }

    /// Drops every pending callback without invoking it and restarts the id counter.
    /// Responses to requests issued before the reset will find nothing in `take`.
    pub fn reset(&self) {
        let dropped = {
            let mut registry = self.lock();
            registry.counter = INITIAL_COUNTER;
            std::mem::take(&mut registry.pending)
        };
        // Dropped outside the lock, closures may own arbitrary state
        tracing::debug!("reset: discarded {} pending callbacks", dropped.len());
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, cmd_id: CommandId) -> bool {
        self.lock().pending.contains_key(&cmd_id)
    }

    #[cfg(test)]
    fn set_counter(&self, counter: CommandId) {
        self.lock().counter = counter;
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::debug;
    use crate::status::ErrorCode;

    type ResponseFn = Box<dyn FnOnce(ErrorCode) + Send>;

    #[derive(Default)]
    struct Recorder {
        hits: AtomicUsize,
    }

    impl CommandCallback for Recorder {}

    fn as_callback(rec: &Arc<Recorder>) -> Weak<dyn CommandCallback> {
        let obj: Arc<dyn CommandCallback> = rec.clone();
        Arc::downgrade(&obj)
    }

    #[test]
    fn test_strong_closure_taken_once() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let cb: ResponseFn = Box::new(move |ec| {
            assert_eq!(ec, ErrorCode::Success);
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });

        let cmd_id = mgr.register_strong(cb);
        assert_eq!(cmd_id, 1);

        let cb = mgr.take_closure::<ResponseFn>(cmd_id).expect("closure must be pending");
        cb(ErrorCode::Success);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(mgr.take(cmd_id).is_none());
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_weak_and_strong_do_not_interfere() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let a = Arc::new(Recorder::default());

        let id_a = mgr.register_weak(as_callback(&a));
        let id_b = mgr.register_strong(String::from("B"));
        assert_eq!((id_a, id_b), (1, 2));

        let b = mgr.take_closure::<String>(id_b);
        assert_eq!(b.as_deref(), Some("B"));
        assert!(mgr.is_pending(id_a));

        let obj = mgr.take_object(id_a).expect("object must still be alive");
        let rec = (*obj).as_any().downcast_ref::<Recorder>().expect("registered a Recorder");
        rec.hits.fetch_add(1, Ordering::SeqCst);
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert!(mgr.take(id_a).is_none());
    }

    #[test]
    fn test_ids_distinct_and_never_reserved() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let keep = Arc::new(Recorder::default());
        let mut seen = HashSet::new();

        for i in 0..2000 {
            let cmd_id = if i % 2 == 0 {
                mgr.register_weak(as_callback(&keep))
            } else {
                mgr.register_strong(i)
            };
            assert_ne!(cmd_id, 0);
            assert_ne!(cmd_id, INVALID_COMMAND_ID);
            assert!(seen.insert(cmd_id), "duplicate cmd_id {}", cmd_id);
        }
        assert_eq!(mgr.pending_count(), 2000);
    }

    #[test]
    fn test_take_unknown_or_negative_does_not_mutate() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let first = mgr.register_strong(1u32);

        assert!(mgr.take(42).is_none());
        assert!(mgr.take(0).is_none());
        assert!(mgr.take(INVALID_COMMAND_ID).is_none());
        assert!(mgr.take(CommandId::MIN).is_none());
        assert_eq!(mgr.pending_count(), 1);
        assert!(mgr.is_pending(first));

        // Counter is unaffected by the failed lookups
        assert_eq!(mgr.register_strong(2u32), first + 1);
    }

    #[test]
    fn test_expired_object_is_removed() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let rec = Arc::new(Recorder::default());
        let cmd_id = mgr.register_weak(as_callback(&rec));
        drop(rec);

        assert!(mgr.is_pending(cmd_id));
        assert!(mgr.take(cmd_id).is_none());
        assert!(!mgr.is_pending(cmd_id));
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_wrong_closure_type_is_dropped() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let cmd_id = mgr.register_strong(7u8);

        assert!(mgr.take_closure::<String>(cmd_id).is_none());
        assert!(mgr.take(cmd_id).is_none());
    }

    #[test]
    fn test_reset_discards_pending_and_restarts_counter() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let rec = Arc::new(Recorder::default());
        let ids = [
            mgr.register_strong(()),
            mgr.register_weak(as_callback(&rec)),
            mgr.register_strong(()),
        ];

        mgr.reset();
        assert_eq!(mgr.pending_count(), 0);
        for cmd_id in ids {
            assert!(mgr.take(cmd_id).is_none());
        }
        assert_eq!(mgr.register_strong(()), 1);

        // Only the weak reference was dropped, the object itself survives
        assert_eq!(Arc::strong_count(&rec), 1);
    }

    #[test]
    fn test_reset_drops_closures() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let owned = Arc::new(());
        mgr.register_strong(owned.clone());
        assert_eq!(Arc::strong_count(&owned), 2);

        mgr.reset();
        assert_eq!(Arc::strong_count(&owned), 1);
    }

    #[test]
    fn test_counter_wrap_restarts_at_one() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        mgr.set_counter(CommandId::MAX - 1);

        assert_eq!(mgr.register_strong(()), CommandId::MAX);
        assert_eq!(mgr.register_strong(()), 1);
    }

    #[test]
    fn test_counter_wrap_skips_outstanding_ids() {
        debug::setup_logging_verbose();
        let mgr: CommandCallbackManager = CommandCallbackManager::new();
        let old = mgr.register_strong(());
        assert_eq!(old, 1);

        mgr.set_counter(CommandId::MAX);
        assert_eq!(mgr.register_strong(()), 2);
        assert!(mgr.is_pending(old));
    }

    #[test]
    fn test_concurrent_registration_unique_ids() {
        debug::setup_logging_verbose();
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;

        let mgr: Arc<CommandCallbackManager> = Arc::new(CommandCallbackManager::new());
        let keep = Arc::new(Recorder::default());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let mgr = mgr.clone();
                let obj = as_callback(&keep);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| {
                            if (t + i) % 2 == 0 {
                                mgr.register_weak(obj.clone())
                            } else {
                                mgr.register_strong(i)
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for cmd_id in handle.join().expect("register thread panicked") {
                assert!(cmd_id > 0);
                all.insert(cmd_id);
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(mgr.pending_count(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_concurrent_take_delivers_at_most_once() {
        debug::setup_logging_verbose();
        let mgr: Arc<CommandCallbackManager> = Arc::new(CommandCallbackManager::new());
        let ids: Vec<CommandId> = (0..1000).map(|i| mgr.register_strong(i)).collect();
        let ids = Arc::new(ids);
        let delivered = Arc::new(AtomicUsize::new(0));

        // Every thread races for every id; each id may be won only once
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = mgr.clone();
                let ids = ids.clone();
                let delivered = delivered.clone();
                thread::spawn(move || {
                    for cmd_id in ids.iter() {
                        if mgr.take(*cmd_id).is_some() {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("take thread panicked");
        }

        assert_eq!(delivered.load(Ordering::SeqCst), 1000);
        assert_eq!(mgr.pending_count(), 0);
    }
}
