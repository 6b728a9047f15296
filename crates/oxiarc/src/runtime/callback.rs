//! Callbacks with an explicit capture of their target.
//!
//! A closure that refers to the object holding it is the classic way to leak
//! under reference counting: the object owns the closure, the closure owns the
//! object. [`Callback`] makes the captured reference an ordinary [`Handle`]
//! with a [`Capture`] kind chosen at construction, so the choice between
//! keeping the target alive, observing it, or assuming it outlives the
//! callback is visible at the call site and in heap snapshots.

use crate::error::Result;
use crate::runtime::handle::{Handle, RefKind};
use crate::runtime::object::ObjectId;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

/// How a [`Callback`] holds its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capture {
    /// The callback keeps the target alive.
    Strong,
    /// The callback does nothing once the target is gone.
    Weak,
    /// Invoking the callback after the target is gone is an error.
    Unowned,
}

impl From<Capture> for RefKind {
    fn from(capture: Capture) -> Self {
        match capture {
            Capture::Strong => RefKind::Strong,
            Capture::Weak => RefKind::Weak,
            Capture::Unowned => RefKind::Unowned,
        }
    }
}

type Body<T, R> = Box<dyn Fn(&mut T) -> R + Send + Sync>;

/// A callback body paired with a captured reference to the object it acts on.
pub struct Callback<T, R = ()> {
    captured: Handle,
    capture: Capture,
    body: Body<T, R>,
    _target: PhantomData<fn(&mut T)>,
}

impl<T: Any, R> Callback<T, R> {
    /// Binds `captured` to `target` with the kind given by `capture` and
    /// pairs it with `body`.
    ///
    /// Pass a handle from [`Store::field`](crate::Store::field) when the
    /// callback is stored inside an object's payload, so that a strong
    /// capture shows up as an edge from that object.
    ///
    /// # Errors
    ///
    /// Any binding error of [`Handle::bind`], or
    /// [`Error::PayloadType`](crate::Error::PayloadType) if the target's
    /// payload is not a `T`.
    pub fn new(
        mut captured: Handle,
        target: ObjectId,
        capture: Capture,
        body: impl Fn(&mut T) -> R + Send + Sync + 'static,
    ) -> Result<Self> {
        // A failed strong bind would release the target on the way out.
        captured.check_target::<T>(target)?;
        captured.bind(capture.into(), target)?;
        Ok(Callback {
            captured,
            capture,
            body: Box::new(body),
            _target: PhantomData,
        })
    }

    /// The capture kind.
    #[must_use]
    pub fn capture(&self) -> Capture {
        self.capture
    }

    /// The captured object, while the capture still refers to one.
    #[must_use]
    pub fn target(&self) -> Option<ObjectId> {
        self.captured.target()
    }

    /// The handle holding the capture.
    #[must_use]
    pub fn captured(&self) -> &Handle {
        &self.captured
    }

    /// Runs the body on the target.
    ///
    /// Returns `Ok(None)` without running it when a weak capture has been
    /// cleared.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterFree`](crate::Error::UseAfterFree) for an unowned
    /// capture whose target is gone, and
    /// [`Error::PayloadBorrowed`](crate::Error::PayloadBorrowed) when invoked
    /// from inside a mutable access to the target.
    pub fn invoke(&self) -> Result<Option<R>> {
        self.captured.resolve_mut(|target: &mut T| (self.body)(target))
    }
}

impl<T, R> fmt::Debug for Callback<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("capture", &self.capture)
            .field("captured", &self.captured)
            .finish_non_exhaustive()
    }
}
