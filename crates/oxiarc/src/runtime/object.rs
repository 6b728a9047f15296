//! Heap objects and their reference counts.
//!
//! Every allocated object lives in an [`ObjectCell`]: a header holding the
//! strong count, the registered weak observers and the finalizer, plus the
//! payload itself. Handles keep the header alive through an `Arc` for as long
//! as they exist, which is what lets a dangling unowned handle detect that its
//! target is gone instead of reading freed memory.
//!
//! # Reference count layout
//!
//! The strong count and the liveness flag share a single `AtomicU32`:
//!
//! ```text
//!  31 30                                    0
//! +--+--------------------------------------+
//! |D |            strong count              |
//! +--+--------------------------------------+
//! ```
//!
//! `D` is set by the release that moves the count from 1 to 0, in the same
//! compare-and-swap. A retain refuses to run once `D` is set, so an object can
//! never be revived by a retain racing with its last release, and the
//! deallocation path runs at most once.
//!
//! # Payload access
//!
//! The payload sits behind a reentrant mutex wrapping a `RefCell`. Other
//! threads block while one thread is accessing it; the same thread can reenter
//! through a different object freely, and gets [`Error::PayloadBorrowed`]
//! instead of a deadlock if it reenters the same object mutably.
//!
//! If the last strong reference disappears while the payload is borrowed
//! (for example a `deref_mut` closure that unbinds the handle keeping its own
//! object alive), the object is marked deallocated immediately and its
//! teardown (finalizer, then payload drop) runs as soon as the borrow ends.

use crate::error::{Error, Result};
use fxhash::FxHashMap;
use parking_lot::{Mutex, ReentrantMutex};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Set once the strong count has dropped to zero.
const DEALLOCATED: u32 = 1 << 31;

/// Largest representable strong count.
pub(crate) const MAX_STRONG: u32 = DEALLOCATED - 1;

pub(crate) type Payload = Box<dyn Any + Send>;
pub(crate) type Finalizer = Box<dyn FnOnce(ObjectId, &mut (dyn Any + Send)) + Send>;

/// Identity of a heap object.
///
/// Ids are issued in increasing order from a counter shared by every
/// [`Store`](crate::Store) in the process and never reused. A store recognizes
/// a stale id of its own as deallocated and any other id as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    /// Builds an id from its raw value.
    ///
    /// Useful for hand-built [`HeapGraph`](crate::HeapGraph)s; a store rejects
    /// ids it did not issue as unknown.
    #[must_use]
    pub const fn from_raw(raw: NonZeroU64) -> Self {
        ObjectId(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Identity of a [`Handle`](crate::Handle), used to key weak observer
/// registrations and strong edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) const fn new(raw: u64) -> Self {
        HandleId(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// The binding of one weak handle.
///
/// Registered with the target's observer set; the target empties it when it
/// deallocates.
pub(crate) struct WeakSlot {
    target: Mutex<Option<Arc<ObjectCell>>>,
}

impl WeakSlot {
    pub(crate) fn new(cell: Arc<ObjectCell>) -> Arc<Self> {
        Arc::new(WeakSlot {
            target: Mutex::new(Some(cell)),
        })
    }

    pub(crate) fn target(&self) -> Option<Arc<ObjectCell>> {
        self.target.lock().clone()
    }

    fn clear(&self) -> bool {
        self.target.lock().take().is_some()
    }
}

/// Header and payload of one heap object.
pub(crate) struct ObjectCell {
    id: ObjectId,
    type_name: &'static str,
    type_id: TypeId,
    refcount: AtomicU32,
    payload: ReentrantMutex<RefCell<Option<Payload>>>,
    finalizer: Mutex<Option<Finalizer>>,
    observers: Mutex<FxHashMap<HandleId, Weak<WeakSlot>>>,
    teardown_pending: AtomicBool,
    #[cfg(feature = "alloc_backtrace")]
    site: Option<Mutex<backtrace::Backtrace>>,
}

impl ObjectCell {
    /// Creates a live object with a strong count of zero.
    pub(crate) fn new<T: Any + Send>(id: ObjectId, payload: T) -> Self {
        ObjectCell {
            id,
            type_name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            refcount: AtomicU32::new(0),
            payload: ReentrantMutex::new(RefCell::new(Some(Box::new(payload)))),
            finalizer: Mutex::new(None),
            observers: Mutex::new(FxHashMap::default()),
            teardown_pending: AtomicBool::new(false),
            #[cfg(feature = "alloc_backtrace")]
            site: None,
        }
    }

    #[cfg(feature = "alloc_backtrace")]
    pub(crate) fn with_allocation_site(mut self, site: backtrace::Backtrace) -> Self {
        self.site = Some(Mutex::new(site));
        self
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn strong_count(&self) -> u32 {
        let bits = self.refcount.load(Ordering::Acquire);
        if bits & DEALLOCATED == 0 { bits } else { 0 }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.refcount.load(Ordering::Acquire) & DEALLOCATED == 0
    }

    /// Increments the strong count, returning the new count.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterFree`] once the object is deallocated.
    ///
    /// # Panics
    ///
    /// Panics with [`Error::RefCountOverflow`] at [`MAX_STRONG`].
    pub(crate) fn try_retain(&self) -> Result<u32> {
        let mut current = self.refcount.load(Ordering::Relaxed);
        loop {
            if current & DEALLOCATED != 0 {
                return Err(Error::UseAfterFree { id: self.id });
            }
            if current == MAX_STRONG {
                panic!("{}", Error::RefCountOverflow { id: self.id });
            }
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrements the strong count, returning the new count.
    ///
    /// A return value of zero means this call deallocated the object: the
    /// caller owns the rest of the deallocation sequence.
    ///
    /// # Panics
    ///
    /// Panics with [`Error::DoubleRelease`] if the count is already zero.
    pub(crate) fn release(&self) -> u32 {
        let mut current = self.refcount.load(Ordering::Relaxed);
        loop {
            if current == 0 || current & DEALLOCATED != 0 {
                panic!("{}", Error::DoubleRelease { id: self.id });
            }
            let next = if current == 1 { DEALLOCATED } else { current - 1 };
            match self.refcount.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn register_observer(&self, handle: HandleId, slot: &Arc<WeakSlot>) -> Result<()> {
        let mut observers = self.observers.lock();
        // Checked under the lock: `clear_observers` drains it after the flip.
        if !self.is_live() {
            return Err(Error::UseAfterFree { id: self.id });
        }
        observers.insert(handle, Arc::downgrade(slot));
        Ok(())
    }

    pub(crate) fn deregister_observer(&self, handle: HandleId) {
        self.observers.lock().remove(&handle);
    }

    pub(crate) fn weak_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Empties every registered weak slot. Returns how many were cleared.
    pub(crate) fn clear_observers(&self) -> usize {
        let drained: Vec<_> = self.observers.lock().drain().map(|(_, slot)| slot).collect();
        drained
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|slot| slot.clear())
            .count()
    }

    /// Replaces the finalizer of a live object.
    pub(crate) fn set_finalizer(&self, finalizer: Finalizer) -> Result<()> {
        if !self.is_live() {
            return Err(Error::UseAfterFree { id: self.id });
        }
        self.install_finalizer(finalizer);
        Ok(())
    }

    pub(crate) fn install_finalizer(&self, finalizer: Finalizer) {
        *self.finalizer.lock() = Some(finalizer);
    }

    pub(crate) fn check_type<T: Any>(&self) -> Result<()> {
        if self.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(self.type_mismatch::<T>())
        }
    }

    fn type_mismatch<T: Any>(&self) -> Error {
        Error::PayloadType {
            id: self.id,
            expected: std::any::type_name::<T>(),
            actual: self.type_name,
        }
    }

    fn payload_ref<'a, T: Any>(&self, payload: Option<&'a (dyn Any + Send)>) -> Result<&'a T> {
        if !self.is_live() {
            return Err(Error::UseAfterFree { id: self.id });
        }
        let payload = payload.ok_or(Error::UseAfterFree { id: self.id })?;
        payload.downcast_ref::<T>().ok_or_else(|| self.type_mismatch::<T>())
    }

    fn payload_mut<'a, T: Any>(
        &self,
        payload: Option<&'a mut (dyn Any + Send)>,
    ) -> Result<&'a mut T> {
        if !self.is_live() {
            return Err(Error::UseAfterFree { id: self.id });
        }
        let payload = payload.ok_or(Error::UseAfterFree { id: self.id })?;
        payload.downcast_mut::<T>().ok_or_else(|| self.type_mismatch::<T>())
    }

    /// Runs `f` on a shared borrow of the payload.
    pub(crate) fn access<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let result = {
            let guard = self.payload.lock();
            match guard.try_borrow() {
                Ok(slot) => self.payload_ref::<T>(slot.as_deref()).map(f),
                Err(_) => Err(Error::PayloadBorrowed { id: self.id }),
            }
        };
        self.finish_teardown();
        result
    }

    /// Runs `f` on an exclusive borrow of the payload.
    pub(crate) fn access_mut<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let result = {
            let guard = self.payload.lock();
            match guard.try_borrow_mut() {
                Ok(mut slot) => self.payload_mut::<T>(slot.as_deref_mut()).map(f),
                Err(_) => Err(Error::PayloadBorrowed { id: self.id }),
            }
        };
        self.finish_teardown();
        result
    }

    /// Schedules the finalizer and payload drop, running them now unless
    /// the payload is borrowed. Returns whether this call tore it down.
    pub(crate) fn request_teardown(&self) -> bool {
        self.teardown_pending.store(true, Ordering::SeqCst);
        self.finish_teardown()
    }

    fn finish_teardown(&self) -> bool {
        if !self.teardown_pending.load(Ordering::SeqCst) {
            return false;
        }
        let payload = {
            let Some(guard) = self.payload.try_lock() else {
                return false;
            };
            let Ok(mut slot) = guard.try_borrow_mut() else {
                return false;
            };
            if !self.teardown_pending.swap(false, Ordering::SeqCst) {
                return false;
            }
            slot.take()
        };

        // Neither lock is held here: the finalizer and the payload's own
        // handles may release further objects.
        let Some(mut payload) = payload else {
            return false;
        };
        if let Some(finalizer) = self.finalizer.lock().take() {
            finalizer(self.id, &mut *payload);
        }
        drop(payload);
        true
    }

    #[cfg(feature = "alloc_backtrace")]
    pub(crate) fn allocation_site(&self) -> Option<String> {
        let site = self.site.as_ref()?;
        let mut site = site.lock();
        site.resolve();
        Some(format!("{site:?}"))
    }

    #[cfg(not(feature = "alloc_backtrace"))]
    pub(crate) fn allocation_site(&self) -> Option<String> {
        None
    }
}

impl fmt::Debug for ObjectCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCell")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("strong", &self.strong_count())
            .field("live", &self.is_live())
            .finish()
    }
}
