//! Reference handles.
//!
//! A [`Handle`] is a slot that is bound to at most one object at a time, with
//! one of three reference kinds:
//!
//! - **Strong** keeps its target alive. Binding retains, unbinding releases,
//!   and the release of the last strong handle deallocates the target on the
//!   spot.
//! - **Weak** observes its target without keeping it alive. When the target
//!   deallocates, every weak handle bound to it is cleared before anyone can
//!   resolve it again.
//! - **Unowned** also leaves the count alone, but is never cleared: resolving
//!   it after its target is gone fails with [`Error::UseAfterFree`].
//!
//! Handles are created by a [`Store`]: [`Store::handle`] for roots (locals,
//! globals) and [`Store::field`] for handles embedded in an object's payload.
//! The distinction only matters for cycle detection.
//!
//! # Example
//!
//! ```rust
//! use oxiarc::{RefKind, Store};
//!
//! let store = Store::new();
//! let id = store.allocate(String::from("Lucas"));
//!
//! let strong = store.strong(id).unwrap();
//! let weak = store.weak(id).unwrap();
//! let unowned = store.unowned(id).unwrap();
//! assert_eq!(weak.kind(), Some(RefKind::Weak));
//!
//! drop(strong);
//! assert_eq!(weak.kind(), None);
//! assert_eq!(weak.resolve(|s: &String| s.len()).unwrap(), None);
//! assert!(unowned.resolve(|s: &String| s.len()).is_err());
//! ```

use crate::error::{Error, Result};
use crate::runtime::object::{HandleId, ObjectCell, ObjectId, WeakSlot};
use crate::runtime::store::{self, Store, StoreShared};
use oxiarc_log::{error, trace};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> HandleId {
    HandleId::new(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// Kind of a bound reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Keeps the target alive.
    Strong,
    /// Observes the target; cleared when it deallocates.
    Weak,
    /// Assumes the target outlives the handle.
    Unowned,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefKind::Strong => "strong",
            RefKind::Weak => "weak",
            RefKind::Unowned => "unowned",
        };
        f.write_str(name)
    }
}

enum Binding {
    Unbound,
    Strong(Arc<ObjectCell>),
    Weak(Arc<WeakSlot>),
    Unowned(Arc<ObjectCell>),
}

/// A reference to at most one heap object.
///
/// Dropping a handle unbinds it. Cloning it creates a new handle with the
/// same owner, bound to the same target with the same kind; a strong clone
/// retains.
pub struct Handle {
    id: HandleId,
    store: Weak<StoreShared>,
    owner: Option<ObjectId>,
    binding: Binding,
}

impl Handle {
    pub(crate) fn new(store: &Store, owner: Option<ObjectId>) -> Self {
        Self::detached(store.downgrade(), owner)
    }

    fn detached(store: Weak<StoreShared>, owner: Option<ObjectId>) -> Self {
        Handle {
            id: next_handle_id(),
            store,
            owner,
            binding: Binding::Unbound,
        }
    }

    fn store(&self) -> Result<Arc<StoreShared>> {
        self.store.upgrade().ok_or(Error::StoreClosed)
    }

    /// Returns the handle's identity.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Returns the object whose payload embeds this handle, `None` for roots.
    #[must_use]
    pub fn owner(&self) -> Option<ObjectId> {
        self.owner
    }

    /// Kind of the current binding. A weak handle whose target has been
    /// deallocated is unbound.
    #[must_use]
    pub fn kind(&self) -> Option<RefKind> {
        match &self.binding {
            Binding::Unbound => None,
            Binding::Strong(_) => Some(RefKind::Strong),
            Binding::Weak(slot) => live_target(slot).map(|_| RefKind::Weak),
            Binding::Unowned(_) => Some(RefKind::Unowned),
        }
    }

    /// Current target. Unowned handles keep reporting their target after it
    /// has been deallocated.
    #[must_use]
    pub fn target(&self) -> Option<ObjectId> {
        match &self.binding {
            Binding::Unbound => None,
            Binding::Strong(cell) | Binding::Unowned(cell) => Some(cell.id()),
            Binding::Weak(slot) => live_target(slot).map(|cell| cell.id()),
        }
    }

    /// Whether the handle is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.kind().is_some()
    }

    /// Binds with the given kind. See [`Handle::bind_strong`],
    /// [`Handle::bind_weak`] and [`Handle::bind_unowned`].
    ///
    /// # Errors
    ///
    /// As the kind-specific method.
    pub fn bind(&mut self, kind: RefKind, id: ObjectId) -> Result<()> {
        match kind {
            RefKind::Strong => self.bind_strong(id),
            RefKind::Weak => self.bind_weak(id),
            RefKind::Unowned => self.bind_unowned(id),
        }
    }

    /// Binds strongly to `id`, retaining it.
    ///
    /// The previous binding is released before the new target is retained.
    /// Rebinding to the current strong target does nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::UseAfterFree`] if `id` is deallocated. The previous binding
    ///   is kept, unless releasing it is what deallocated `id`; then the
    ///   handle is left unbound.
    /// - [`Error::UnknownObject`] if the store never issued `id`.
    /// - [`Error::StoreClosed`] if the store has been dropped.
    ///
    /// # Panics
    ///
    /// Panics if the strong count of `id` overflows.
    pub fn bind_strong(&mut self, id: ObjectId) -> Result<()> {
        if let Binding::Strong(cell) = &self.binding
            && cell.id() == id
        {
            return Ok(());
        }

        let store = self.store()?;
        let cell = live_cell(&store, id)?;
        self.unbind_in(Some(&store));

        store::retain(&cell)?;
        store.record_edge(self.id, self.owner, id);
        trace!("{} bound strong to {}", self.id, id);
        self.binding = Binding::Strong(cell);
        Ok(())
    }

    /// Binds weakly to `id`, registering as one of its observers.
    ///
    /// # Errors
    ///
    /// As [`Handle::bind_strong`].
    pub fn bind_weak(&mut self, id: ObjectId) -> Result<()> {
        let store = self.store()?;
        let cell = live_cell(&store, id)?;
        self.unbind_in(Some(&store));

        let slot = WeakSlot::new(Arc::clone(&cell));
        cell.register_observer(self.id, &slot)?;
        trace!("{} bound weak to {}", self.id, id);
        self.binding = Binding::Weak(slot);
        Ok(())
    }

    /// Binds unowned to `id`. Neither the strong count nor the observer set
    /// changes.
    ///
    /// # Errors
    ///
    /// As [`Handle::bind_strong`].
    pub fn bind_unowned(&mut self, id: ObjectId) -> Result<()> {
        let store = self.store()?;
        let cell = live_cell(&store, id)?;
        self.unbind_in(Some(&store));

        if !cell.is_live() {
            return Err(Error::UseAfterFree { id });
        }
        trace!("{} bound unowned to {}", self.id, id);
        self.binding = Binding::Unowned(cell);
        Ok(())
    }

    /// Clears the binding. A strong binding is released, which deallocates
    /// the target if this was its last strong handle.
    pub fn unbind(&mut self) {
        let store = self.store.upgrade();
        self.unbind_in(store.as_deref());
    }

    fn unbind_in(&mut self, store: Option<&StoreShared>) {
        match std::mem::replace(&mut self.binding, Binding::Unbound) {
            Binding::Unbound | Binding::Unowned(_) => {}
            Binding::Weak(slot) => {
                if let Some(cell) = slot.target() {
                    cell.deregister_observer(self.id);
                }
            }
            Binding::Strong(cell) => {
                if let Some(store) = store {
                    store.forget_edge(self.id);
                }
                store::release(store, cell);
            }
        }
    }

    /// Runs `f` on the target's payload.
    ///
    /// Returns `Ok(None)` when the handle is unbound, including a weak handle
    /// whose target has been deallocated.
    ///
    /// # Errors
    ///
    /// - [`Error::UseAfterFree`] for an unowned handle whose target is gone
    /// - [`Error::PayloadType`] if the payload is not a `T`
    /// - [`Error::PayloadBorrowed`] if the payload is mutably borrowed
    pub fn resolve<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Result<Option<R>> {
        self.resolve_with(|cell| cell.access(f))
    }

    /// Runs `f` on the target's payload, mutably.
    ///
    /// # Errors
    ///
    /// As [`Handle::resolve`].
    pub fn resolve_mut<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<Option<R>> {
        self.resolve_with(|cell| cell.access_mut(f))
    }

    fn resolve_with<R>(
        &self,
        access: impl FnOnce(&ObjectCell) -> Result<R>,
    ) -> Result<Option<R>> {
        match &self.binding {
            Binding::Unbound => Ok(None),
            Binding::Strong(cell) => access(cell).map(Some),
            Binding::Weak(slot) => {
                let Some(cell) = slot.target() else {
                    return Ok(None);
                };
                match access(&cell) {
                    Err(Error::UseAfterFree { .. }) => Ok(None),
                    other => other.map(Some),
                }
            }
            Binding::Unowned(cell) => access(cell).map(Some).map_err(|err| self.dangling(err)),
        }
    }

    fn dangling(&self, err: Error) -> Error {
        if let Error::UseAfterFree { id } = err {
            error!("unowned {} used after {} was deallocated", self.id, id);
        }
        err
    }

    /// Creates a new strong root handle to the current target.
    ///
    /// Returns `Ok(None)` when the handle is unbound or its weak target is
    /// gone. Works after the store has been dropped.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterFree`] for an unowned handle whose target is gone.
    pub fn upgrade(&self) -> Result<Option<Handle>> {
        let (cell, weak) = match &self.binding {
            Binding::Unbound => return Ok(None),
            Binding::Strong(cell) => (Arc::clone(cell), false),
            Binding::Weak(slot) => match slot.target() {
                Some(cell) => (cell, true),
                None => return Ok(None),
            },
            Binding::Unowned(cell) => (Arc::clone(cell), false),
        };

        match store::retain(&cell) {
            Ok(_) => {}
            Err(Error::UseAfterFree { .. }) if weak => return Ok(None),
            Err(err) => return Err(self.dangling(err)),
        }

        let mut handle = Handle::detached(self.store.clone(), None);
        if let Some(store) = handle.store.upgrade() {
            store.record_edge(handle.id, None, cell.id());
        }
        handle.binding = Binding::Strong(cell);
        Ok(Some(handle))
    }

    /// Checks that `id` is live in this handle's store and holds a `T`,
    /// without binding to it.
    pub(crate) fn check_target<T: Any>(&self, id: ObjectId) -> Result<()> {
        let store = self.store()?;
        live_cell(&store, id)?.check_type::<T>()
    }
}

fn live_cell(store: &StoreShared, id: ObjectId) -> Result<Arc<ObjectCell>> {
    let cell = store.lookup(id)?;
    if cell.is_live() {
        Ok(cell)
    } else {
        Err(Error::UseAfterFree { id })
    }
}

fn live_target(slot: &WeakSlot) -> Option<Arc<ObjectCell>> {
    slot.target().filter(|cell| cell.is_live())
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        let mut handle = Handle::detached(self.store.clone(), self.owner);
        handle.binding = match &self.binding {
            Binding::Unbound => Binding::Unbound,
            Binding::Strong(cell) => match store::retain(cell) {
                Ok(_) => {
                    if let Some(store) = handle.store.upgrade() {
                        store.record_edge(handle.id, handle.owner, cell.id());
                    }
                    Binding::Strong(Arc::clone(cell))
                }
                Err(_) => Binding::Unbound,
            },
            Binding::Weak(slot) => match slot.target() {
                Some(cell) => {
                    let slot = WeakSlot::new(Arc::clone(&cell));
                    match cell.register_observer(handle.id, &slot) {
                        Ok(()) => Binding::Weak(slot),
                        Err(_) => Binding::Unbound,
                    }
                }
                None => Binding::Unbound,
            },
            Binding::Unowned(cell) => Binding::Unowned(Arc::clone(cell)),
        };
        handle
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("kind", &self.kind())
            .field("target", &self.target())
            .finish()
    }
}
