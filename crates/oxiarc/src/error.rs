//! Error types for the `OxiArc` runtime.
//!
//! Recoverable failures are returned as [`Error`] values. Two variants,
//! [`Error::DoubleRelease`] and [`Error::RefCountOverflow`], describe broken
//! internal invariants: the runtime never returns them and instead panics with
//! their message.

use crate::runtime::ObjectId;

/// Errors that can occur in the `OxiArc` runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The object was deallocated: a direct `deref` after its last strong
    /// reference went away, or an unowned handle that outlived its target.
    #[error("use after free: {id} has been deallocated")]
    UseAfterFree {
        /// The deallocated object.
        id: ObjectId,
    },

    /// A release without a matching retain. Fatal.
    #[error("double release of {id}: strong count is already zero")]
    DoubleRelease {
        /// The over-released object.
        id: ObjectId,
    },

    /// The strong count reached its maximum. Fatal.
    #[error("reference count overflow on {id}")]
    RefCountOverflow {
        /// The object whose count overflowed.
        id: ObjectId,
    },

    /// The id was never issued by this store.
    #[error("unknown object {id}")]
    UnknownObject {
        /// The unrecognized id.
        id: ObjectId,
    },

    /// The payload was accessed as the wrong type.
    #[error("{id} holds a `{actual}`, not a `{expected}`")]
    PayloadType {
        /// The accessed object.
        id: ObjectId,
        /// Type requested by the caller.
        expected: &'static str,
        /// Type stored at allocation.
        actual: &'static str,
    },

    /// The payload is already borrowed further up the current call stack.
    #[error("payload of {id} is already borrowed")]
    PayloadBorrowed {
        /// The accessed object.
        id: ObjectId,
    },

    /// The store that issued this handle has been dropped.
    #[error("object store has been dropped")]
    StoreClosed,

    /// A heap snapshot was requested from a store that does not track edges.
    #[error("strong edge tracking is disabled for this store")]
    EdgeTrackingDisabled,
}

/// Result type for `OxiArc` runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
