//! The per-thread views of backend state.
//!
//! A [ThreadView] is the thread's mirror of one backend: it holds a copy of the
//! backend's `(properties, error, available)` state and only ever mutates it from
//! events delivered on its owning thread. This makes reads safe without locking and
//! keeps the data stable between event deliveries, even while signals are being
//! emitted. All handles on one thread for the same target share a single view, so they
//! always agree on the data, including inside signal handlers.

use {
    crate::{
        backend::{self, clone_properties, clone_value, BackendEvent, BackendRef},
        cache::CacheShared,
        error::{error_kind, CacheError},
        target::Target,
    },
    ahash::AHashMap,
    std::{
        cell::RefCell,
        collections::HashMap,
        mem,
        rc::{Rc, Weak},
    },
    tokio::sync::mpsc::{self, UnboundedReceiver},
    zbus::zvariant::OwnedValue,
};

pub(crate) struct ThreadView {
    pub(crate) target: Target,
    backend: BackendRef,
    subscriber: u64,
    pub(crate) state: RefCell<ViewState>,
    handles: RefCell<Vec<Weak<CacheShared>>>,
}

pub(crate) struct ViewState {
    pub(crate) properties: HashMap<String, OwnedValue>,
    pub(crate) error: Option<CacheError>,
    pub(crate) available: bool,
}

/// A signal emitted by a [ThreadView] to its connected handles.
pub(crate) enum ViewEvent<'a> {
    AvailableChanged(bool),
    ErrorChanged(Option<&'a CacheError>),
    PropertiesReset(&'a HashMap<String, OwnedValue>),
    PropertyChanged(&'a str, Option<&'a OwnedValue>),
    Ready,
    Lost,
}

thread_local! {
    static VIEWS: RefCell<AHashMap<Target, Weak<ThreadView>>> = RefCell::new(AHashMap::new());
}

impl ThreadView {
    /// Returns this thread's view of `target`, creating it if necessary.
    ///
    /// A new view subscribes to the backend and snapshots its state in the same
    /// critical section, then spawns a local task that applies the backend's events on
    /// this thread.
    pub(crate) fn local_instance(target: &Target) -> Rc<ThreadView> {
        VIEWS.with(|views| {
            if let Some(view) = views.borrow().get(target) {
                if let Some(view) = view.upgrade() {
                    return view;
                }
            }
            let backend = backend::instance(target);
            let (events, queue) = mpsc::unbounded_channel();
            let (subscriber, properties, error, available) = backend.get().subscribe(events);
            let view = Rc::new(ThreadView {
                target: target.clone(),
                backend,
                subscriber,
                state: RefCell::new(ViewState {
                    properties,
                    error,
                    available,
                }),
                handles: RefCell::new(Vec::new()),
            });
            views.borrow_mut().insert(target.clone(), Rc::downgrade(&view));
            tokio::task::spawn_local(deliver(Rc::downgrade(&view), queue));
            view
        })
    }

    pub(crate) fn connect(&self, handle: Weak<CacheShared>) {
        self.handles.borrow_mut().push(handle);
    }

    fn emit(&self, event: &ViewEvent) {
        // Snapshot the handle list so that handlers can create or initialize further
        // handles while signals are being delivered.
        let handles: Vec<Rc<CacheShared>> = {
            let mut handles = self.handles.borrow_mut();
            handles.retain(|h| h.strong_count() > 0);
            handles.iter().filter_map(Weak::upgrade).collect()
        };
        for handle in handles {
            handle.deliver(event);
        }
    }

    /// Applies a full reset of the mirror and emits the change signals.
    ///
    /// The order is fixed:
    ///   1. Update the state
    ///   2. availableChanged and errorChanged if they changed
    ///   3. propertiesReset if either the old or new set is non-empty
    ///   4. propertyChanged for every changed, added, or removed property
    ///   5. lost or ready
    fn reset(&self, properties: HashMap<String, OwnedValue>, error: Option<CacheError>) {
        let available = error.is_none();
        let was_available;
        let before;
        let error_changed;
        {
            let mut state = self.state.borrow_mut();
            was_available = state.available;
            error_changed = error_kind(&state.error) != error_kind(&error);
            before = mem::replace(&mut state.properties, properties);
            state.available = available;
            state.error = error.clone();
        }
        // Emission data is collected up front; handlers are free to read the mirror
        // while signals are delivered.
        let after = clone_properties(&self.state.borrow().properties);
        let mut changed: Vec<(&str, Option<&OwnedValue>)> = Vec::new();
        for (name, value) in &after {
            if before.get(name) != Some(value) {
                changed.push((name.as_str(), Some(value)));
            }
        }
        for name in before.keys() {
            if !after.contains_key(name) {
                changed.push((name.as_str(), None));
            }
        }
        if was_available != available {
            self.emit(&ViewEvent::AvailableChanged(available));
        }
        if error_changed {
            self.emit(&ViewEvent::ErrorChanged(error.as_ref()));
        }
        if !after.is_empty() || !before.is_empty() {
            self.emit(&ViewEvent::PropertiesReset(&after));
        }
        for (name, value) in changed {
            self.emit(&ViewEvent::PropertyChanged(name, value));
        }
        if was_available && !available {
            self.emit(&ViewEvent::Lost);
        }
        if !was_available && available {
            self.emit(&ViewEvent::Ready);
        }
    }

    /// Applies individual property changes. Every entry is applied to the mirror
    /// before any propertyChanged is emitted, so a handler observing one change
    /// already sees all others from the same bus message.
    fn change(&self, values: HashMap<String, Option<OwnedValue>>) {
        {
            let mut state = self.state.borrow_mut();
            for (name, value) in &values {
                match value {
                    Some(value) => {
                        state.properties.insert(name.clone(), clone_value(value));
                    }
                    None => {
                        state.properties.remove(name);
                    }
                }
            }
        }
        for (name, value) in &values {
            self.emit(&ViewEvent::PropertyChanged(name.as_str(), value.as_ref()));
        }
    }
}

async fn deliver(view: Weak<ThreadView>, mut queue: UnboundedReceiver<BackendEvent>) {
    while let Some(event) = queue.recv().await {
        let Some(view) = view.upgrade() else {
            break;
        };
        match event {
            BackendEvent::Reset { properties, error } => view.reset(properties, error),
            BackendEvent::Change { values } => view.change(values),
        }
    }
}

impl Drop for ThreadView {
    fn drop(&mut self) {
        let _ = VIEWS.try_with(|views| {
            views.borrow_mut().remove(&self.target);
        });
        self.backend.get().unsubscribe(self.subscriber);
    }
}
