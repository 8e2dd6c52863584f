use {
    crate::{
        backend::{clone_properties, clone_value, PROPERTIES_INTERFACE, SET},
        bus::Bus,
        error::CacheError,
        target::Target,
        view::{ThreadView, ViewEvent},
    },
    error_reporter::Report,
    std::{
        cell::{Cell, RefCell},
        collections::HashMap,
        rc::Rc,
    },
    zbus::{
        names::{BusName, InterfaceName},
        zvariant::{ObjectPath, OwnedValue, Value},
    },
};

/// An asynchronous cache of the properties of one remote D-Bus object.
///
/// A PropertyCache loads the properties of its [Target] automatically, keeps them up to
/// date from `PropertiesChanged` signals, resets them when the service connects or
/// disconnects, and shares its data with every other PropertyCache for the same target
/// in the process. Reads never block and never touch the bus.
///
/// # Initialization
///
/// A newly constructed PropertyCache is always empty and unavailable, even if the data
/// is already known to the process. Once the owning thread returns to its event loop,
/// the cache initializes and emits signals in a fixed order:
///
/// 1. `availableChanged(true)`
/// 2. `errorChanged` if the error state changed
/// 3. `propertiesReset` with all properties
/// 4. `propertyChanged` for every property
/// 5. `ready`
///
/// [Self::get] returns full and consistent data even in the middle of this sequence.
/// Connect callbacks first, then optionally call [Self::initialize] to run the sequence
/// immediately when the data is already known.
///
/// When the data becomes unavailable, for example because the service exited, the
/// order is `availableChanged(false)`, `errorChanged`, `propertiesReset` with an empty
/// map, `propertyChanged` clearing every property, and finally `lost`.
///
/// # Consistency
///
/// If [Self::is_available] returns true, every property provided by the service has a
/// value; if it returns false, no property has a value. Changes carried by a single
/// bus message are applied atomically: during any `propertyChanged` callback, all other
/// changes from the same message are already readable. Caches for the same target on
/// the same thread agree on the data at all times, including inside callbacks.
///
/// # Threading
///
/// A PropertyCache belongs to the thread that created it and the type is `!Send`, so it
/// cannot be moved or shared across threads. The owning thread must run an event loop:
/// a current-thread tokio runtime driving a [tokio::task::LocalSet]. Without one the
/// cache never updates.
///
/// Cloning is cheap and returns a handle to the same cache: clones share their
/// initialization state and callbacks.
#[derive(Clone)]
pub struct PropertyCache {
    shared: Rc<CacheShared>,
}

type Callbacks<T> = RefCell<Vec<Rc<T>>>;

pub(crate) struct CacheShared {
    view: Rc<ThreadView>,
    initialized: Cell<bool>,
    available_changed: Callbacks<dyn Fn(&PropertyCache, bool)>,
    error_changed: Callbacks<dyn Fn(&PropertyCache, Option<&CacheError>)>,
    ready: Callbacks<dyn Fn(&PropertyCache)>,
    lost: Callbacks<dyn Fn(&PropertyCache)>,
    property_changed: Callbacks<dyn Fn(&PropertyCache, &str, Option<&OwnedValue>)>,
    properties_reset: Callbacks<dyn Fn(&PropertyCache, &HashMap<String, OwnedValue>)>,
}

impl PropertyCache {
    /// Creates a cache for `target` and schedules its initialization.
    pub fn new(target: &Target) -> Self {
        let view = ThreadView::local_instance(target);
        let shared = Rc::new(CacheShared {
            view,
            initialized: Cell::new(false),
            available_changed: Default::default(),
            error_changed: Default::default(),
            ready: Default::default(),
            lost: Default::default(),
            property_changed: Default::default(),
            properties_reset: Default::default(),
        });
        log::debug!("created PropertyCache for {target}");
        let meaningful = {
            let state = shared.view.state.borrow();
            state.available || state.error.is_some()
        };
        if !meaningful {
            // Nothing is known yet, so initializing only connects the forwarders and
            // emits nothing.
            shared.initialize();
        } else {
            // Pretend the data does not exist yet and initialize on the next turn of
            // the event loop. This gives the caller time to connect callbacks first.
            let shared = Rc::downgrade(&shared);
            tokio::task::spawn_local(async move {
                if let Some(shared) = shared.upgrade() {
                    shared.initialize();
                }
            });
        }
        Self { shared }
    }

    /// Creates a cache from the individual target fields. See [Self::new].
    pub fn from_parts(
        bus: &Bus,
        service: impl Into<BusName<'static>>,
        path: impl Into<ObjectPath<'static>>,
        interface: impl Into<InterfaceName<'static>>,
    ) -> Self {
        Self::new(&Target::new(bus, service, path, interface))
    }

    /// Returns the target of this cache.
    pub fn target(&self) -> &Target {
        &self.shared.view.target
    }

    /// Returns the bus of this cache.
    pub fn bus(&self) -> &Bus {
        self.target().bus()
    }

    /// Returns true if the properties are available.
    ///
    /// While this returns false, every read returns an empty value. Reasons include
    /// that the cache was just created, that the service is not running, or that the
    /// service reported an error; see [Self::error].
    pub fn is_available(&self) -> bool {
        self.shared.initialized.get() && self.shared.view.state.borrow().available
    }

    /// Returns the current error, if any.
    pub fn error(&self) -> Option<CacheError> {
        if !self.shared.initialized.get() {
            return None;
        }
        self.shared.view.state.borrow().error.clone()
    }

    /// Returns true if the property currently has a value.
    pub fn contains(&self, property: &str) -> bool {
        self.shared.initialized.get()
            && self
                .shared
                .view
                .state
                .borrow()
                .properties
                .contains_key(property)
    }

    /// Returns the cached value of a property, or `None` if the property does not
    /// exist or no data is available.
    pub fn get(&self, property: &str) -> Option<OwnedValue> {
        if !self.shared.initialized.get() {
            return None;
        }
        self.shared
            .view
            .state
            .borrow()
            .properties
            .get(property)
            .map(clone_value)
    }

    /// Returns the cached value of a property converted to `T`.
    ///
    /// Returns `None` if the property has no value or the value has the wrong type.
    pub fn get_as<T: TryFrom<OwnedValue>>(&self, property: &str) -> Option<T> {
        self.get(property).and_then(|v| T::try_from(v).ok())
    }

    /// Returns all cached properties.
    pub fn get_all(&self) -> HashMap<String, OwnedValue> {
        if !self.shared.initialized.get() {
            return HashMap::new();
        }
        clone_properties(&self.shared.view.state.borrow().properties)
    }

    /// Initializes the cache immediately instead of on the next event-loop turn.
    ///
    /// If data or an error is already known, the full initialization sequence is
    /// emitted synchronously and true is returned. If a bus call is still pending,
    /// nothing is emitted and false is returned. Calling this on an initialized cache
    /// does nothing and returns whether the mirror is meaningful.
    pub fn initialize(&self) -> bool {
        self.shared.initialize()
    }

    /// Asks the service to change a property.
    ///
    /// The call is asynchronous and does not update the cached value: the value only
    /// changes once the service emits the resulting `PropertiesChanged` signal. The
    /// call can fail without any user-visible effect; failures are logged.
    ///
    /// A `value` that is already a variant is sent as-is; any other value is wrapped
    /// once in the wire variant type.
    pub fn set<'v>(&self, property: &str, value: impl Into<Value<'v>>) {
        let target = self.target();
        let value = match value.into() {
            Value::Value(value) => *value,
            value => value,
        };
        let property_name = property.to_string();
        let target_name = target.to_string();
        let mut call = target.bus().connection().call_async(
            target.service(),
            PROPERTIES_INTERFACE,
            target.path(),
            SET,
            &(target.interface().as_str(), property, &value),
            move |res: Result<(), bussy::Error>| {
                if let Err(e) = res {
                    log::warn!(
                        "failed to set property {property_name} for {target_name}: {}",
                        Report::new(e)
                    );
                }
            },
        );
        call.detach();
    }

    /// Registers a callback for availability changes.
    ///
    /// Callbacks receive the cache itself, so they do not need to capture a clone of
    /// it. Capturing a clone of the cache in one of its own callbacks keeps the cache
    /// alive forever.
    pub fn on_available_changed(&self, callback: impl Fn(&PropertyCache, bool) + 'static) {
        self.shared
            .available_changed
            .borrow_mut()
            .push(Rc::new(callback));
    }

    /// Registers a callback for error changes.
    pub fn on_error_changed(
        &self,
        callback: impl Fn(&PropertyCache, Option<&CacheError>) + 'static,
    ) {
        self.shared
            .error_changed
            .borrow_mut()
            .push(Rc::new(callback));
    }

    /// Registers a callback invoked after the properties become available.
    pub fn on_ready(&self, callback: impl Fn(&PropertyCache) + 'static) {
        self.shared.ready.borrow_mut().push(Rc::new(callback));
    }

    /// Registers a callback invoked after the properties become unavailable.
    pub fn on_lost(&self, callback: impl Fn(&PropertyCache) + 'static) {
        self.shared.lost.borrow_mut().push(Rc::new(callback));
    }

    /// Registers a callback for individual property changes. A value of `None` means
    /// the property no longer has a value.
    pub fn on_property_changed(
        &self,
        callback: impl Fn(&PropertyCache, &str, Option<&OwnedValue>) + 'static,
    ) {
        self.shared
            .property_changed
            .borrow_mut()
            .push(Rc::new(callback));
    }

    /// Registers a callback for full property resets.
    pub fn on_properties_reset(
        &self,
        callback: impl Fn(&PropertyCache, &HashMap<String, OwnedValue>) + 'static,
    ) {
        self.shared
            .properties_reset
            .borrow_mut()
            .push(Rc::new(callback));
    }
}

impl CacheShared {
    fn initialize(self: &Rc<Self>) -> bool {
        if self.initialized.get() {
            let state = self.view.state.borrow();
            return state.available || state.error.is_some();
        }
        self.view.connect(Rc::downgrade(self));
        self.initialized.set(true);
        let (available, error, properties) = {
            let state = self.view.state.borrow();
            (
                state.available,
                state.error.clone(),
                clone_properties(&state.properties),
            )
        };
        if error.is_some() {
            self.deliver(&ViewEvent::ErrorChanged(error.as_ref()));
        }
        if !available {
            return error.is_some();
        }
        // The same order as a reset delivered by the view.
        self.deliver(&ViewEvent::AvailableChanged(true));
        self.deliver(&ViewEvent::PropertiesReset(&properties));
        for (name, value) in &properties {
            self.deliver(&ViewEvent::PropertyChanged(name.as_str(), Some(value)));
        }
        self.deliver(&ViewEvent::Ready);
        true
    }

    pub(crate) fn deliver(self: &Rc<Self>, event: &ViewEvent) {
        if !self.initialized.get() {
            return;
        }
        let cache = PropertyCache {
            shared: self.clone(),
        };
        match event {
            ViewEvent::AvailableChanged(available) => {
                let callbacks = self.available_changed.borrow().clone();
                for callback in callbacks {
                    callback(&cache, *available);
                }
            }
            ViewEvent::ErrorChanged(error) => {
                let callbacks = self.error_changed.borrow().clone();
                for callback in callbacks {
                    callback(&cache, *error);
                }
            }
            ViewEvent::PropertiesReset(properties) => {
                let callbacks = self.properties_reset.borrow().clone();
                for callback in callbacks {
                    callback(&cache, properties);
                }
            }
            ViewEvent::PropertyChanged(name, value) => {
                let callbacks = self.property_changed.borrow().clone();
                for callback in callbacks {
                    callback(&cache, name, *value);
                }
            }
            ViewEvent::Ready => {
                let callbacks = self.ready.borrow().clone();
                for callback in callbacks {
                    callback(&cache);
                }
            }
            ViewEvent::Lost => {
                let callbacks = self.lost.borrow().clone();
                for callback in callbacks {
                    callback(&cache);
                }
            }
        }
    }
}
