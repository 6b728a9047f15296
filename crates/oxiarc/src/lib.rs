//! `OxiArc`: a reference-counted object runtime
//!
//! `OxiArc` models automatic reference counting as a library. Objects live in
//! a [`Store`] and are reached through [`Handle`]s of three kinds:
//!
//! - **Strong** handles keep their target alive
//! - **Weak** handles observe it and are cleared when it goes away
//! - **Unowned** handles assume it outlives them and report
//!   [`Error::UseAfterFree`] when it does not
//!
//! Deallocation is deterministic: the object is torn down (finalizer, then
//! payload) inside the call that released its last strong reference.
//! Strong reference cycles are not collected; [`CycleDetector`] finds them
//! in a heap snapshot.
//!
//! # Example
//!
//! ```rust
//! use oxiarc::{Handle, Store};
//!
//! struct Person {
//!     name: String,
//!     apartment: Handle,
//! }
//!
//! struct Apartment {
//!     unit: String,
//!     tenant: Handle,
//! }
//!
//! let store = Store::new();
//! let john = store.allocate_with(|id| Person {
//!     name: "John".into(),
//!     apartment: store.field(id),
//! });
//! let unit = store.allocate_with(|id| Apartment {
//!     unit: "4A".into(),
//!     tenant: store.field(id),
//! });
//!
//! let mut john_var = store.strong(john)?;
//! let unit_var = store.strong(unit)?;
//! store.deref_mut(john, |p: &mut Person| p.apartment.bind_strong(unit))??;
//! // The tenant is weak, so the two objects do not keep each other alive.
//! store.deref_mut(unit, |a: &mut Apartment| a.tenant.bind_weak(john))??;
//!
//! john_var.unbind();
//! assert!(!store.is_live(john));
//! assert_eq!(unit_var.resolve(|a: &Apartment| a.tenant.is_bound())?, Some(false));
//! assert!(store.leak_report()?.is_clean());
//! # Ok::<(), oxiarc::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::{
    Callback, Capture, CycleDetector, Handle, HandleId, HeapGraph, HeapNode, LeakReport,
    ObjectId, RefKind, Store, StoreStats, StrongEdge,
};
