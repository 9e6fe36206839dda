//! Weakly-held collection of application listeners
//!
//! Listeners are owned by the application. Entries whose owner is gone are
//! purged lazily, whenever the collection is walked.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::status::Status;

/// Number of distinct indications that can be selected in an indication mask
pub const MAX_INDICATIONS: u32 = u32::BITS;

struct Listeners<L: ?Sized> {
    /// Listeners interested in everything
    all: Vec<Weak<L>>,
    /// Indication bit -> listeners registered for that indication
    by_indication: BTreeMap<u32, Vec<Weak<L>>>,
}

pub struct ListenerManager<L: ?Sized> {
    inner: Mutex<Listeners<L>>,
}

impl<L: ?Sized> Default for ListenerManager<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> ListenerManager<L> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Listeners {
                all: Vec::new(),
                by_indication: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Listeners<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_listener(&self, listener: Weak<L>) -> Status {
        if listener.strong_count() == 0 {
            tracing::error!("register_listener: null listener");
            return Status::InvalidParam;
        }

        let mut inner = self.lock();
        if inner.all.iter().any(|existing| Weak::ptr_eq(existing, &listener)) {
            tracing::debug!("register_listener: listener already exists");
            return Status::Already;
        }
        tracing::debug!("register_listener: new listener entry");
        inner.all.push(listener);
        Status::Success
    }

    pub fn deregister_listener(&self, listener: &Weak<L>) -> Status {
        let mut found = false;
        self.lock().all.retain(|existing| {
            if Weak::ptr_eq(existing, listener) {
                found = true;
                false
            } else {
                existing.strong_count() > 0
            }
        });

        if found {
            Status::Success
        } else {
            tracing::warn!("deregister_listener: listener not found");
            Status::NoSuch
        }
    }

    /// Returns strong handles to all live listeners
    pub fn get_available_listeners(&self) -> Vec<Arc<L>> {
        let mut available = Vec::new();
        self.lock().all.retain(|wp| match wp.upgrade() {
            Some(sp) => {
                available.push(sp);
                true
            }
            None => {
                tracing::debug!("erased obsolete weak pointer from listeners");
                false
            }
        });
        available
    }

    /// Registers `listener` for every indication selected in `indications`.
    /// Returns the status and the mask of indications that got their first listener,
    /// which the caller typically needs to enable at the service.
    pub fn register_for(&self, listener: Weak<L>, indications: u32) -> (Status, u32) {
        if listener.strong_count() == 0 {
            tracing::error!("register_for: null listener");
            return (Status::InvalidParam, 0);
        }
        if indications == 0 {
            tracing::warn!("register_for: no indications provided");
            return (Status::Success, 0);
        }

        let mut first_registration = 0;
        let mut new_listener = false;
        let mut inner = self.lock();
        for bit in (0..MAX_INDICATIONS).filter(|bit| indications & (1u32 << *bit) != 0) {
            let registered = inner.by_indication.entry(bit).or_default();
            registered.retain(|wp| wp.strong_count() > 0);
            if registered.is_empty() {
                first_registration |= 1u32 << bit;
            }
            if registered.iter().any(|wp| Weak::ptr_eq(wp, &listener)) {
                tracing::debug!("register_for: listener already exists for {}", bit);
            } else {
                new_listener = true;
                registered.push(listener.clone());
            }
        }

        if new_listener {
            (Status::Success, first_registration)
        } else {
            (Status::Already, first_registration)
        }
    }

    /// Removes `listener` from every indication selected in `indications`.
    /// Returns the status and the mask of indications that lost their last listener.
    pub fn deregister_for(&self, listener: &Weak<L>, indications: u32) -> (Status, u32) {
        if listener.strong_count() == 0 {
            tracing::error!("deregister_for: null listener");
            return (Status::InvalidParam, 0);
        }
        if indications == 0 {
            tracing::warn!("deregister_for: no indications provided");
            return (Status::Success, 0);
        }

        let mut last_deregistration = 0;
        let mut existed = false;
        let mut inner = self.lock();
        for bit in (0..MAX_INDICATIONS).filter(|bit| indications & (1u32 << *bit) != 0) {
            let Some(registered) = inner.by_indication.get_mut(&bit) else {
                continue;
            };
            let mut matched = false;
            registered.retain(|wp| {
                if Weak::ptr_eq(wp, listener) {
                    matched = true;
                    false
                } else {
                    wp.strong_count() > 0
                }
            });
            if matched {
                existed = true;
                if registered.is_empty() {
                    last_deregistration |= 1u32 << bit;
                }
            }
        }

        if existed {
            (Status::Success, last_deregistration)
        } else {
            tracing::error!("deregister_for: listener not found");
            (Status::NoSuch, last_deregistration)
        }
    }

    /// Returns the live listeners registered for the given indication bit
    pub fn listeners_for(&self, indication: u32) -> Vec<Arc<L>> {
        let mut available = Vec::new();
        let mut inner = self.lock();
        let Some(registered) = inner.by_indication.get_mut(&indication) else {
            return available;
        };
        registered.retain(|wp| match wp.upgrade() {
            Some(sp) => {
                available.push(sp);
                true
            }
            None => {
                tracing::debug!("erased obsolete weak pointer from indication {}", indication);
                false
            }
        });
        available
    }

    /// Mask of indications that have at least one live listener
    pub fn active_indications(&self) -> u32 {
        self.lock()
            .by_indication
            .iter()
            .filter(|(_, registered)| registered.iter().any(|wp| wp.strong_count() > 0))
            .fold(0, |mask, (bit, _)| mask | (1u32 << *bit))
    }

    /// Whether `listener` is registered for at least one indication
    pub fn is_enabled_for_any(&self, listener: &Weak<L>) -> bool {
        self.lock()
            .by_indication
            .values()
            .any(|registered| registered.iter().any(|wp| Weak::ptr_eq(wp, listener)))
    }

    /// Removes all references to listeners
    pub fn cleanup(&self) {
        tracing::debug!("cleanup");
        let mut inner = self.lock();
        inner.all.clear();
        inner.by_indication.clear();
    }
}
