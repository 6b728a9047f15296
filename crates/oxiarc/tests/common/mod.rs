// Common test fixtures for integration tests
//
// Payload types standing in for the classes of the ARC playgrounds, plus
// finalizer counters.

#![allow(dead_code)]

use oxiarc::{Callback, Handle, ObjectId, Store};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts finalizer runs.
#[derive(Debug, Clone, Default)]
pub struct Deinits(Arc<AtomicUsize>);

impl Deinits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn tick(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub first: String,
    pub last: String,
}

impl Person {
    pub fn new(first: &str, last: &str) -> Self {
        Person {
            first: first.to_owned(),
            last: last.to_owned(),
        }
    }
}

#[derive(Debug)]
pub struct Device {
    pub model: String,
    pub manufacturer: String,
}

/// Allocates a device whose finalizer ticks `deinits`.
pub fn device(store: &Store, model: &str, deinits: &Deinits) -> ObjectId {
    let deinits = deinits.clone();
    store.allocate_with_finalizer(
        Device {
            model: model.to_owned(),
            manufacturer: "Apple".to_owned(),
        },
        move |_, _| deinits.tick(),
    )
}

/// A streaming-service account; holds its plan strongly.
pub struct Account {
    pub plan: Handle,
}

/// A plan; its back reference to the account is the one to weaken.
pub struct Plan {
    pub name: String,
    pub account: Handle,
}

pub fn account(store: &Store, deinits: &Deinits) -> ObjectId {
    let deinits = deinits.clone();
    let id = store.allocate_with(|id| Account {
        plan: store.field(id),
    });
    store
        .set_finalizer(id, move |_, _: &mut Account| deinits.tick())
        .unwrap();
    id
}

pub fn plan(store: &Store, name: &str, deinits: &Deinits) -> ObjectId {
    let deinits = deinits.clone();
    let id = store.allocate_with(|id| Plan {
        name: name.to_owned(),
        account: store.field(id),
    });
    store
        .set_finalizer(id, move |_, _: &mut Plan| deinits.tick())
        .unwrap();
    id
}

/// A table view; its delegate is the view controller that owns it.
pub struct TableView {
    pub delegate: Handle,
    pub rows: usize,
}

/// A view controller owning a table view and an optional closure.
pub struct ViewController {
    pub title: String,
    pub table_view: Handle,
    pub on_update: Option<Arc<Callback<ViewController, usize>>>,
    pub updates: usize,
}

pub fn view_controller(store: &Store, title: &str, deinits: &Deinits) -> ObjectId {
    let deinits = deinits.clone();
    let id = store.allocate_with(|id| ViewController {
        title: title.to_owned(),
        table_view: store.field(id),
        on_update: None,
        updates: 0,
    });
    store
        .set_finalizer(id, move |_, _: &mut ViewController| deinits.tick())
        .unwrap();
    id
}

pub fn table_view(store: &Store, deinits: &Deinits) -> ObjectId {
    let deinits = deinits.clone();
    let id = store.allocate_with(|id| TableView {
        delegate: store.field(id),
        rows: 0,
    });
    store
        .set_finalizer(id, move |_, _: &mut TableView| deinits.tick())
        .unwrap();
    id
}

/// Installs an `updateView` closure on `vc`, capturing `vc` itself.
pub fn install_update_handler(store: &Store, vc: ObjectId, capture: oxiarc::Capture) {
    let callback = Callback::new(store.field(vc), vc, capture, |vc: &mut ViewController| {
        vc.updates += 1;
        vc.updates
    })
    .unwrap();
    store
        .deref_mut(vc, |v: &mut ViewController| v.on_update = Some(Arc::new(callback)))
        .unwrap();
}

/// Takes the update handler out of the payload so it can be invoked.
pub fn update_handler(store: &Store, vc: ObjectId) -> Option<Arc<Callback<ViewController, usize>>> {
    store
        .deref(vc, |v: &ViewController| v.on_update.clone())
        .ok()
        .flatten()
}
