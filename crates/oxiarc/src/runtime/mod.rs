//! `OxiArc` runtime module.
//!
//! - [`object`]: object ids and the reference-counted cell behind each object
//! - [`store`]: allocation, lookup and deallocation
//! - [`handle`]: strong, weak and unowned references
//! - [`callback`]: closures with an explicit capture of their target
//! - [`cycle`]: heap snapshots and leak detection
//!
//! Ownership runs one way only. A [`Store`] owns its objects, objects own the
//! handles in their payloads, and handles own the header of the object they
//! point at. Handles refer back to the store weakly, so a store never keeps
//! itself alive through its own payloads.

pub mod callback;
pub mod cycle;
pub mod handle;
pub mod object;
pub mod store;

pub use callback::{Callback, Capture};
pub use cycle::{CycleDetector, HeapGraph, HeapNode, LeakReport, StrongEdge};
pub use handle::{Handle, RefKind};
pub use object::{HandleId, ObjectId};
pub use store::{Store, StoreStats};
