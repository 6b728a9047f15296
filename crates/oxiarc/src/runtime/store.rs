//! The object store: allocation, lookup and deallocation bookkeeping.
//!
//! A [`Store`] owns the table of live objects. Objects enter it through
//! [`Store::allocate`] with a strong count of zero and leave it the instant
//! their strong count drops from one to zero. There is no collector and no
//! deferred sweep: deallocation happens inside the `unbind` (or handle drop)
//! that released the last strong reference.
//!
//! The store also keeps, per bound strong handle, the edge
//! `owner -> target` that [`Store::snapshot`] turns into a [`HeapGraph`]
//! for the cycle detector.
//!
//! # Example
//!
//! ```rust
//! use oxiarc::Store;
//!
//! struct Device {
//!     model: String,
//! }
//!
//! let store = Store::new();
//! let id = store.allocate(Device { model: "iPhone 12 Pro Max".into() });
//! assert_eq!(store.strong_count(id), Some(0));
//!
//! let lucas = store.strong(id).unwrap();
//! let chabby = lucas.clone();
//! assert_eq!(store.strong_count(id), Some(2));
//!
//! drop(lucas);
//! assert!(store.is_live(id));
//! drop(chabby);
//! assert!(!store.is_live(id));
//! assert!(store.deref(id, |d: &Device| d.model.clone()).is_err());
//! ```

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::cycle::{CycleDetector, HeapGraph, HeapNode, LeakReport, StrongEdge};
use crate::runtime::handle::{Handle, RefKind};
use crate::runtime::object::{Finalizer, HandleId, ObjectCell, ObjectId};
use fxhash::{FxHashMap, FxHashSet};
use oxiarc_log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Object ids are unique across every store in the process, so an id from
/// one store never names an object of another.
static NEXT_OBJECT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Objects waiting for their finalizer and payload drop behind the
    /// outermost release on this thread. `None` while nothing is draining.
    static TEARDOWNS: RefCell<Option<VecDeque<Arc<ObjectCell>>>> = const { RefCell::new(None) };
}

/// Allocation counters of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Objects allocated since the store was created.
    pub allocated: u64,
    /// Objects deallocated since the store was created.
    pub deallocated: u64,
}

impl StoreStats {
    /// Objects currently live.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.allocated.saturating_sub(self.deallocated)
    }
}

/// State shared between a [`Store`] and the handles it created.
///
/// Handles only hold a `Weak` reference to it: payloads routinely contain
/// handles, and the store owns the payloads.
pub(crate) struct StoreShared {
    config: RuntimeConfig,
    objects: RwLock<FxHashMap<ObjectId, Arc<ObjectCell>>>,
    retired: Mutex<FxHashSet<ObjectId>>,
    edges: Mutex<FxHashMap<HandleId, StrongEdge>>,
    allocated: AtomicU64,
    deallocated: AtomicU64,
}

impl StoreShared {
    fn new(config: RuntimeConfig) -> Self {
        StoreShared {
            config,
            objects: RwLock::new(FxHashMap::default()),
            retired: Mutex::new(FxHashSet::default()),
            edges: Mutex::new(FxHashMap::default()),
            allocated: AtomicU64::new(0),
            deallocated: AtomicU64::new(0),
        }
    }

    fn issue_id(&self) -> ObjectId {
        let issued = NEXT_OBJECT.fetch_add(1, Ordering::Relaxed);
        ObjectId::from_raw(NonZeroU64::MIN.saturating_add(issued))
    }

    /// Finds an object, distinguishing stale ids from foreign ones.
    pub(crate) fn lookup(&self, id: ObjectId) -> Result<Arc<ObjectCell>> {
        let objects = self.objects.read();
        if let Some(cell) = objects.get(&id) {
            return Ok(Arc::clone(cell));
        }
        // Checked under the read guard: `retire` moves an id from the table
        // to the retired set while holding the write guard.
        if self.retired.lock().contains(&id) {
            Err(Error::UseAfterFree { id })
        } else {
            Err(Error::UnknownObject { id })
        }
    }

    pub(crate) fn record_edge(&self, handle: HandleId, owner: Option<ObjectId>, target: ObjectId) {
        if self.config.track_edges {
            self.edges.lock().insert(handle, StrongEdge { owner, target });
        }
    }

    pub(crate) fn forget_edge(&self, handle: HandleId) {
        if self.config.track_edges {
            self.edges.lock().remove(&handle);
        }
    }

    fn retire(&self, cell: &ObjectCell) {
        let removed = {
            let mut objects = self.objects.write();
            self.retired.lock().insert(cell.id());
            objects.remove(&cell.id())
        };
        self.deallocated.fetch_add(1, Ordering::Relaxed);
        drop(removed);
    }
}

/// Takes one strong reference to `cell`.
pub(crate) fn retain(cell: &ObjectCell) -> Result<u32> {
    let count = cell.try_retain()?;
    trace!("retain {} -> {}", cell.id(), count);
    Ok(count)
}

/// Drops one strong reference to `cell`, deallocating it if that was the last.
///
/// The sequence on the last release is: liveness flip (inside
/// [`ObjectCell::release`]), weak observers cleared, removal from the store,
/// then finalizer and payload drop. The last step runs through [`tear_down`]
/// and is complete when the outermost release on this thread returns, unless
/// the payload is borrowed, in which case the borrow finishes it.
pub(crate) fn release(store: Option<&StoreShared>, cell: Arc<ObjectCell>) {
    let remaining = cell.release();
    trace!("release {} -> {}", cell.id(), remaining);
    if remaining > 0 {
        return;
    }

    let cleared = cell.clear_observers();
    if let Some(store) = store {
        store.retire(&cell);
    }
    debug!(
        "{} {} is now deallocated ({} weak reference(s) cleared)",
        short_type_name(cell.type_name()),
        cell.id(),
        cleared
    );
    tear_down(cell);
}

/// Runs the finalizer of a deallocated object and drops its payload.
///
/// Dropping a payload releases the handles inside it, which can deallocate
/// further objects. Those are queued and torn down by the outermost call in a
/// loop, so the stack depth does not grow with the length of a strong chain.
fn tear_down(cell: Arc<ObjectCell>) {
    let queued = TEARDOWNS.try_with(|queue| {
        let mut queue = queue.borrow_mut();
        match queue.as_mut() {
            Some(pending) => {
                pending.push_back(Arc::clone(&cell));
                true
            }
            None => {
                *queue = Some(VecDeque::new());
                false
            }
        }
    });
    match queued {
        Ok(true) => return,
        Ok(false) => {}
        // Thread-local storage is gone while the thread exits.
        Err(_) => {
            cell.request_teardown();
            return;
        }
    }

    let _drain = Drain;
    let mut next = Some(cell);
    while let Some(cell) = next {
        cell.request_teardown();
        drop(cell);
        next = TEARDOWNS
            .try_with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front))
            .ok()
            .flatten();
    }
}

/// Ends the drain on this thread, even if a finalizer panicked.
struct Drain;

impl Drop for Drain {
    fn drop(&mut self) {
        let rest = TEARDOWNS.try_with(|queue| queue.borrow_mut().take()).ok().flatten();
        drop(rest);
    }
}

fn short_type_name(name: &'static str) -> &'static str {
    let base = name.split('<').next().unwrap_or(name);
    match base.rfind("::") {
        Some(pos) => &name[pos + 2..],
        None => name,
    }
}

fn boxed_finalizer<T: Any>(finalizer: impl FnOnce(ObjectId, &mut T) + Send + 'static) -> Finalizer {
    Box::new(move |id: ObjectId, payload: &mut (dyn Any + Send)| {
        if let Some(value) = payload.downcast_mut::<T>() {
            finalizer(id, value);
        }
    })
}

/// A table of reference-counted heap objects.
///
/// Cloning a `Store` is cheap and yields another reference to the same
/// table. Dropping the last one frees every object still in it; objects that
/// reach a zero strong count during that teardown run their finalizers as
/// usual, the others do not. Handles that outlive the store keep working for
/// `resolve` and `unbind`, while new bindings fail with
/// [`Error::StoreClosed`].
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Creates an empty store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates an empty store.
    ///
    /// If the configuration carries a log level, it is installed globally.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        if let Some(level) = config.log_level {
            oxiarc_log::set_level(level);
        }
        Store {
            shared: Arc::new(StoreShared::new(config)),
        }
    }

    /// Returns the configuration the store was created with.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.shared.config
    }

    pub(crate) fn downgrade(&self) -> Weak<StoreShared> {
        Arc::downgrade(&self.shared)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates an object. Its strong count starts at zero: it stays in the
    /// store until a strong handle is bound to it and later released.
    pub fn allocate<T: Any + Send>(&self, payload: T) -> ObjectId {
        self.allocate_with(|_| payload)
    }

    /// Allocates an object whose payload needs its own id, typically to
    /// create field handles owned by it with [`Store::field`].
    ///
    /// The object is not in the store while `build` runs.
    pub fn allocate_with<T: Any + Send>(&self, build: impl FnOnce(ObjectId) -> T) -> ObjectId {
        let id = self.shared.issue_id();
        self.insert(ObjectCell::new(id, build(id)))
    }

    /// Allocates an object with a finalizer that runs exactly once, when the
    /// object is deallocated, with exclusive access to the payload.
    pub fn allocate_with_finalizer<T: Any + Send>(
        &self,
        payload: T,
        finalizer: impl FnOnce(ObjectId, &mut T) + Send + 'static,
    ) -> ObjectId {
        let id = self.shared.issue_id();
        let cell = ObjectCell::new(id, payload);
        cell.install_finalizer(boxed_finalizer(finalizer));
        self.insert(cell)
    }

    fn insert(&self, cell: ObjectCell) -> ObjectId {
        #[cfg(feature = "alloc_backtrace")]
        let cell = if self.shared.config.capture_backtraces {
            cell.with_allocation_site(backtrace::Backtrace::new_unresolved())
        } else {
            cell
        };

        let id = cell.id();
        trace!("allocate {} ({})", id, cell.type_name());
        self.shared.objects.write().insert(id, Arc::new(cell));
        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Installs or replaces the finalizer of a live object.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterFree`] or [`Error::UnknownObject`] if `id` is not
    /// live; [`Error::PayloadType`] if the payload is not a `T`.
    pub fn set_finalizer<T: Any + Send>(
        &self,
        id: ObjectId,
        finalizer: impl FnOnce(ObjectId, &mut T) + Send + 'static,
    ) -> Result<()> {
        let cell = self.shared.lookup(id)?;
        cell.check_type::<T>()?;
        cell.set_finalizer(boxed_finalizer(finalizer))
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// Runs `f` on the payload of a live object.
    ///
    /// # Errors
    ///
    /// - [`Error::UseAfterFree`] if the object has been deallocated
    /// - [`Error::UnknownObject`] if this store never issued `id`
    /// - [`Error::PayloadType`] if the payload is not a `T`
    /// - [`Error::PayloadBorrowed`] if `f`'s caller holds it mutably
    pub fn deref<T: Any, R>(&self, id: ObjectId, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.shared.lookup(id)?.access(f)
    }

    /// Runs `f` on the payload of a live object, mutably.
    ///
    /// Mutations are visible through every handle bound to the object.
    ///
    /// # Errors
    ///
    /// As [`Store::deref`]; [`Error::PayloadBorrowed`] also covers any
    /// enclosing shared borrow of the same payload.
    pub fn deref_mut<T: Any, R>(&self, id: ObjectId, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.shared.lookup(id)?.access_mut(f)
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Creates an unbound handle not owned by any object, such as a local
    /// variable or a global.
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle::new(self, None)
    }

    /// Creates an unbound handle embedded in `owner`'s payload. Strong
    /// bindings of this handle are reported as edges `owner -> target`.
    #[must_use]
    pub fn field(&self, owner: ObjectId) -> Handle {
        Handle::new(self, Some(owner))
    }

    /// Creates a root handle bound strongly to `id`.
    ///
    /// # Errors
    ///
    /// See [`Handle::bind_strong`].
    pub fn strong(&self, id: ObjectId) -> Result<Handle> {
        self.bound(RefKind::Strong, id)
    }

    /// Creates a root handle bound weakly to `id`.
    ///
    /// # Errors
    ///
    /// See [`Handle::bind_weak`].
    pub fn weak(&self, id: ObjectId) -> Result<Handle> {
        self.bound(RefKind::Weak, id)
    }

    /// Creates a root handle bound unowned to `id`.
    ///
    /// # Errors
    ///
    /// See [`Handle::bind_unowned`].
    pub fn unowned(&self, id: ObjectId) -> Result<Handle> {
        self.bound(RefKind::Unowned, id)
    }

    fn bound(&self, kind: RefKind, id: ObjectId) -> Result<Handle> {
        let mut handle = self.handle();
        handle.bind(kind, id)?;
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Whether `id` refers to a live object of this store.
    #[must_use]
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.shared
            .objects
            .read()
            .get(&id)
            .is_some_and(|cell| cell.is_live())
    }

    /// Strong count of a live object, `None` once it is deallocated.
    #[must_use]
    pub fn strong_count(&self, id: ObjectId) -> Option<u32> {
        self.shared
            .objects
            .read()
            .get(&id)
            .filter(|cell| cell.is_live())
            .map(|cell| cell.strong_count())
    }

    /// Number of weak handles observing a live object.
    #[must_use]
    pub fn weak_count(&self, id: ObjectId) -> Option<usize> {
        let cell = self.shared.objects.read().get(&id).cloned()?;
        cell.is_live().then(|| cell.weak_count())
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.objects.read().len()
    }

    /// Whether the store holds no live objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocation counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        // Read first so a concurrent deallocation cannot outrun `allocated`.
        let deallocated = self.shared.deallocated.load(Ordering::Relaxed);
        StoreStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            deallocated,
        }
    }

    // ------------------------------------------------------------------
    // Leak detection
    // ------------------------------------------------------------------

    /// Captures the live objects and the strong edges between them.
    ///
    /// The snapshot is taken without stopping other threads, so it is only
    /// exact when the heap is quiescent.
    ///
    /// # Errors
    ///
    /// [`Error::EdgeTrackingDisabled`] if the store was configured without
    /// edge tracking.
    pub fn snapshot(&self) -> Result<HeapGraph> {
        if !self.shared.config.track_edges {
            return Err(Error::EdgeTrackingDisabled);
        }

        let cells: Vec<Arc<ObjectCell>> = self.shared.objects.read().values().cloned().collect();
        let edges: Vec<StrongEdge> = self.shared.edges.lock().values().copied().collect();

        let mut graph = HeapGraph::new();
        for cell in cells.iter().filter(|cell| cell.is_live()) {
            graph.add_node(HeapNode {
                id: cell.id(),
                type_name: cell.type_name(),
                strong_count: cell.strong_count(),
                weak_count: cell.weak_count(),
                allocation_site: cell.allocation_site(),
            });
        }
        for edge in edges {
            if graph.contains(edge.target) && edge.owner.is_none_or(|owner| graph.contains(owner)) {
                graph.add_edge(edge.owner, edge.target);
            }
        }
        Ok(graph)
    }

    /// Snapshots the heap and reports objects kept alive only by strong
    /// reference cycles, treating every owner-less strong handle as a root.
    ///
    /// # Errors
    ///
    /// As [`Store::snapshot`].
    pub fn leak_report(&self) -> Result<LeakReport> {
        let graph = self.snapshot()?;
        let report = CycleDetector::with_external_roots(&graph).detect();

        for cycle in report.cycles() {
            let members: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            warn!("strong reference cycle among {}", members.join(", "));
        }
        if !report.is_clean() {
            warn!(
                "{} object(s) leaked in {} cycle(s)",
                report.leaked().len(),
                report.cycles().len()
            );
        }
        Ok(report)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("live", &self.len())
            .field("stats", &self.stats())
            .field("config", &self.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxiarc_log::Level;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, PartialEq)]
    struct Person {
        first: String,
        last: String,
    }

    fn person(first: &str, last: &str) -> Person {
        Person {
            first: first.to_owned(),
            last: last.to_owned(),
        }
    }

    #[test]
    fn test_allocate_starts_live_with_zero_count() {
        let store = Store::new();
        let id = store.allocate(person("John", "Lucas"));

        assert!(store.is_live(id));
        assert_eq!(store.strong_count(id), Some(0));
        assert_eq!(store.weak_count(id), Some(0));
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats(), StoreStats { allocated: 1, deallocated: 0 });
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let store = Store::new();
        let a = store.allocate(1u8);
        let b = store.allocate(2u8);
        let c = store.allocate_with(|_| 3u8);

        assert!(a < b && b < c);

        let other = Store::new();
        let d = other.allocate(4u8);
        assert!(c < d);
        assert!(!store.is_live(d) && !other.is_live(a));
    }

    #[test]
    fn test_cascade_finalizes_in_chain_order() {
        struct Link {
            next: Handle,
        }

        let store = Store::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let ids: Vec<ObjectId> = (0..4)
            .map(|_| {
                let order = Arc::clone(&order);
                let id = store.allocate_with(|id| Link { next: store.field(id) });
                store
                    .set_finalizer(id, move |id, _: &mut Link| order.lock().push(id))
                    .unwrap();
                id
            })
            .collect();
        for pair in ids.windows(2) {
            store
                .deref_mut(pair[0], |l: &mut Link| l.next.bind_strong(pair[1]))
                .unwrap()
                .unwrap();
        }

        drop(store.strong(ids[0]).unwrap());
        assert_eq!(*order.lock(), ids);
        assert!(store.is_empty());
    }

    #[test]
    fn test_live_count_never_underflows() {
        // A racing `stats()` can observe a deallocation whose allocation it
        // missed.
        let stats = StoreStats { allocated: 1, deallocated: 2 };
        assert_eq!(stats.live(), 0);
        assert_eq!(StoreStats { allocated: 5, deallocated: 2 }.live(), 3);
    }

    #[test]
    fn test_deref_and_mutation_are_shared() {
        let store = Store::new();
        let lucas = store.allocate(person("John", "Lucas"));
        let chabby = store.strong(lucas).unwrap();

        store
            .deref_mut(lucas, |p: &mut Person| p.first = "Chabby".to_owned())
            .unwrap();

        let first = chabby.resolve(|p: &Person| p.first.clone()).unwrap();
        assert_eq!(first.as_deref(), Some("Chabby"));
        assert_eq!(store.deref(lucas, |p: &Person| p.last.clone()).unwrap(), "Lucas");
    }

    #[test]
    fn test_deref_errors() {
        let store = Store::new();
        let id = store.allocate(5u32);

        let err = store.deref(id, |s: &String| s.len()).unwrap_err();
        assert!(matches!(err, Error::PayloadType { actual: "u32", .. }));

        let foreign = Store::new().allocate(5u32);
        assert_eq!(
            store.deref(foreign, |v: &u32| *v),
            Err(Error::UnknownObject { id: foreign })
        );
    }

    #[test]
    fn test_deref_after_deallocation_is_use_after_free() {
        let store = Store::new();
        let id = store.allocate(person("John", "Lucas"));
        drop(store.strong(id).unwrap());

        assert!(!store.is_live(id));
        assert_eq!(store.strong_count(id), None);
        assert_eq!(store.deref(id, |p: &Person| p.first.len()), Err(Error::UseAfterFree { id }));
        assert_eq!(store.stats().deallocated, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_finalizer_runs_once_with_payload() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        let store = Store::new();
        let id = store.allocate_with_finalizer(person("John", "Lucas"), |_, p| {
            assert_eq!(p.first, "John");
            SEEN.fetch_add(1, Ordering::SeqCst);
        });

        let h1 = store.strong(id).unwrap();
        let h2 = h1.clone();
        drop(h1);
        assert_eq!(SEEN.load(Ordering::SeqCst), 0);
        drop(h2);
        assert_eq!(SEEN.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_finalizer_checks_type_and_liveness() {
        let store = Store::new();
        let id = store.allocate(7u64);

        assert!(matches!(
            store.set_finalizer(id, |_, _: &mut u32| {}),
            Err(Error::PayloadType { .. })
        ));
        store.set_finalizer(id, |_, v: &mut u64| *v = 0).unwrap();

        drop(store.strong(id).unwrap());
        assert_eq!(
            store.set_finalizer(id, |_, _: &mut u64| {}),
            Err(Error::UseAfterFree { id })
        );
    }

    #[test]
    fn test_release_inside_own_deref_defers_teardown() {
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);

        struct SelfOwned {
            keeper: Handle,
        }

        let store = Store::new();
        let id = store.allocate_with(|id| SelfOwned {
            keeper: store.field(id),
        });
        store
            .set_finalizer(id, |_, _: &mut SelfOwned| {
                FINALIZED.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        store.deref_mut(id, |s: &mut SelfOwned| s.keeper.bind_strong(id)).unwrap().unwrap();
        assert_eq!(store.strong_count(id), Some(1));

        store
            .deref_mut(id, |s: &mut SelfOwned| {
                s.keeper.unbind();
                assert!(!store.is_live(id));
                assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);
            })
            .unwrap();

        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deallocation_is_logged() {
        let (id, records) = oxiarc_log::capture(Level::Debug, || {
            let store = Store::new();
            let id = store.allocate(person("iPhone 12", "Apple"));
            drop(store.strong(id).unwrap());
            id
        });

        let expected = format!("Person {id} is now deallocated");
        assert!(records.iter().any(|r| r.message.contains(&expected)));
    }

    #[test]
    fn test_snapshot_requires_edge_tracking() {
        let store = Store::with_config(RuntimeConfig::new().with_edge_tracking(false));
        store.allocate(1u8);
        assert_eq!(store.snapshot().unwrap_err(), Error::EdgeTrackingDisabled);
    }

    #[test]
    fn test_snapshot_contains_nodes_and_edges() {
        struct Node {
            next: Handle,
        }

        let store = Store::new();
        let a = store.allocate_with(|id| Node { next: store.field(id) });
        let b = store.allocate(0u8);
        let root = store.strong(a).unwrap();
        store.deref_mut(a, |n: &mut Node| n.next.bind_strong(b)).unwrap().unwrap();

        let graph = store.snapshot().unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.node(b).map(|n| n.strong_count), Some(1));
        assert_eq!(graph.external_roots(), vec![a]);
        assert!(graph.edges().contains(&StrongEdge { owner: Some(a), target: b }));
        assert!(store.leak_report().unwrap().is_clean());
        drop(root);
        assert!(store.is_empty());
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("oxiarc::runtime::store::tests::Person"), "Person");
        assert_eq!(short_type_name("u32"), "u32");
        assert_eq!(short_type_name("alloc::vec::Vec<core::option::Option<u8>>"), "Vec<core::option::Option<u8>>");
    }

    #[test]
    fn test_store_drop_frees_unreferenced_objects() {
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);
        let store = Store::new();
        let kept = store.allocate_with_finalizer(1u8, |_, _| {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        });
        let handle = store.strong(kept).unwrap();
        drop(store);

        assert_eq!(handle.resolve(|v: &u8| *v).unwrap(), Some(1));
        let mut other = handle.clone();
        assert_eq!(other.bind_weak(kept), Err(Error::StoreClosed));
        drop(other);
        drop(handle);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    }
}
