//! The per-target backends and the process-global backend registry.
//!
//! There is one [Backend] per target, shared by every thread in the process. Backends
//! live on a dedicated backend thread, where they own all bus traffic for their target:
//! the initial `GetAll`, the name-owner watcher, the `PropertiesChanged` subscription,
//! and `Set` calls. State changes fan out to the per-thread views through one unbounded
//! channel per view, which preserves the emission order for each recipient.
//!
//! When the last view releases a backend, it is not destroyed. Ownership moves to a
//! small list of unused backends that are kept alive in case the same target is needed
//! again shortly, which avoids a `GetAll` round-trip. The oldest entry is destroyed
//! once the list is full.

use {
    crate::{
        error::{CacheError, ErrorKind},
        target::Target,
    },
    ahash::AHashMap,
    bussy::MatchRuleBuilder,
    isnt::std_1::primitive::IsntStrExt,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        future::Future,
        sync::{mpsc as std_mpsc, Arc, OnceLock, Weak},
        time::Duration,
    },
    tokio::sync::mpsc::UnboundedSender,
    zbus::{
        message::Type,
        names::{InterfaceName, MemberName, WellKnownName},
        zvariant::{ObjectPath, OwnedValue},
        Message,
    },
};

pub(crate) const PROPERTIES_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("org.freedesktop.DBus.Properties");
pub(crate) const SET: MemberName<'static> = MemberName::from_static_str_unchecked("Set");
const GET_ALL: MemberName<'static> = MemberName::from_static_str_unchecked("GetAll");
const PROPERTIES_CHANGED: MemberName<'static> =
    MemberName::from_static_str_unchecked("PropertiesChanged");
const GET_NAME_OWNER: MemberName<'static> =
    MemberName::from_static_str_unchecked("GetNameOwner");
const DBUS_NAME: WellKnownName<'static> =
    WellKnownName::from_static_str_unchecked("org.freedesktop.DBus");
const DBUS_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("org.freedesktop.DBus");
const DBUS_PATH: ObjectPath<'static> =
    ObjectPath::from_static_str_unchecked("/org/freedesktop/DBus");

/// How many released backends are kept alive for reuse.
const UNUSED_BACKEND_CAPACITY: usize = 5;

/// How long to wait after a service appears before loading its properties.
const RELOAD_DELAY: Duration = Duration::from_millis(50);

pub(crate) fn clone_value(value: &OwnedValue) -> OwnedValue {
    value.try_clone().unwrap()
}

pub(crate) fn clone_properties(
    properties: &HashMap<String, OwnedValue>,
) -> HashMap<String, OwnedValue> {
    properties
        .iter()
        .map(|(k, v)| (k.clone(), clone_value(v)))
        .collect()
}

fn clone_changes(
    values: &HashMap<String, Option<OwnedValue>>,
) -> HashMap<String, Option<OwnedValue>> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), v.as_ref().map(clone_value)))
        .collect()
}

/// A state change fanned out from a [Backend] to its subscribed views.
pub(crate) enum BackendEvent {
    /// The full property set was replaced.
    Reset {
        properties: HashMap<String, OwnedValue>,
        error: Option<CacheError>,
    },
    /// Individual properties changed. `None` means the property was removed.
    Change {
        values: HashMap<String, Option<OwnedValue>>,
    },
}

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

struct BackendThread {
    jobs: UnboundedSender<Job>,
    finished: Mutex<Option<std_mpsc::Receiver<()>>>,
}

static BACKEND_THREAD: OnceLock<BackendThread> = OnceLock::new();

fn backend_thread() -> &'static BackendThread {
    BACKEND_THREAD.get_or_init(|| {
        let (jobs, mut queue) = tokio::sync::mpsc::unbounded_channel();
        let (finished, finished_recv) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("propsy-backend".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("could not create the backend runtime");
                rt.block_on(async move {
                    while let Some(job) = queue.recv().await {
                        match job {
                            Job::Run(job) => job(),
                            Job::Quit => break,
                        }
                    }
                });
                let _ = finished.send(());
            })
            .expect("could not spawn the backend thread");
        BackendThread {
            jobs,
            finished: Mutex::new(Some(finished_recv)),
        }
    })
}

/// Runs a job on the backend thread. Jobs run in posting order.
pub(crate) fn post(job: impl FnOnce() + Send + 'static) {
    let _ = backend_thread().jobs.send(Job::Run(Box::new(job)));
}

/// Runs a future on the backend thread and blocks until it completes.
///
/// Returns `None` if the backend thread has been shut down. Must not be called from
/// the backend thread itself.
pub(crate) fn block_on<T, F>(future: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (send, recv) = std_mpsc::channel();
    post(move || {
        tokio::spawn(async move {
            let _ = send.send(future.await);
        });
    });
    recv.recv().ok()
}

/// Shuts down the shared backend machinery.
///
/// All unused backends are destroyed and the backend thread is stopped once its queued
/// work has drained. Waits up to 5 seconds for the thread to finish. This is only
/// needed for an orderly process shutdown; caches must not be used afterwards.
pub fn shutdown() {
    clear_unused();
    let Some(thread) = BACKEND_THREAD.get() else {
        return;
    };
    let _ = thread.jobs.send(Job::Quit);
    if let Some(finished) = thread.finished.lock().take() {
        if finished.recv_timeout(Duration::from_secs(5)).is_err() {
            log::warn!("the backend thread did not stop within 5 seconds");
        }
    }
}

struct Registry {
    live: AHashMap<Target, Weak<Backend>>,
    warm: Vec<Arc<Backend>>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            live: Default::default(),
            warm: Default::default(),
        })
    })
}

/// Returns the backend for `target`, creating it if necessary.
///
/// A freshly created backend schedules its initial load on the backend thread. A
/// backend restored from the unused list is returned as-is; its watchers are still
/// installed and its state is still valid.
pub(crate) fn instance(target: &Target) -> BackendRef {
    let mut reg = registry().lock();
    if let Some(weak) = reg.live.get(target) {
        if let Some(backend) = weak.upgrade() {
            return BackendRef::new(backend);
        }
    }
    if let Some(pos) = reg.warm.iter().position(|b| &b.target == target) {
        let backend = reg.warm.remove(pos);
        log::debug!("restored backend for {target} from the unused cache");
        reg.live.insert(target.clone(), Arc::downgrade(&backend));
        return BackendRef::new(backend);
    }
    let backend = Arc::new(Backend {
        target: target.clone(),
        data: Default::default(),
    });
    log::debug!("created backend for {target}");
    reg.live.insert(target.clone(), Arc::downgrade(&backend));
    let weak = Arc::downgrade(&backend);
    post(move || {
        if let Some(backend) = weak.upgrade() {
            backend.load();
        }
    });
    BackendRef::new(backend)
}

fn release(backend: Arc<Backend>) {
    let mut reg = registry().lock();
    if Arc::strong_count(&backend) > 1 {
        // Another view grabbed the backend while this reference was being dropped.
        return;
    }
    log::debug!("released backend for {} to the unused cache", backend.target);
    reg.live.remove(&backend.target);
    reg.warm.insert(0, backend);
    while reg.warm.len() > UNUSED_BACKEND_CAPACITY {
        if let Some(oldest) = reg.warm.pop() {
            // Destruction uninstalls the bus subscriptions, so it happens on the
            // backend thread like all other bus work.
            post(move || drop(oldest));
        }
    }
}

pub(crate) fn backends_empty() -> bool {
    let reg = registry().lock();
    reg.live.is_empty() && reg.warm.is_empty()
}

pub(crate) fn clear_unused() {
    let mut reg = registry().lock();
    for backend in reg.warm.drain(..) {
        post(move || drop(backend));
    }
}

/// A strong reference to a [Backend] that returns it to the registry on drop.
pub(crate) struct BackendRef {
    backend: Option<Arc<Backend>>,
}

impl BackendRef {
    fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub(crate) fn get(&self) -> &Arc<Backend> {
        self.backend.as_ref().unwrap()
    }
}

impl Drop for BackendRef {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            release(backend);
        }
    }
}

pub(crate) struct Backend {
    pub(crate) target: Target,
    data: Mutex<BackendData>,
}

#[derive(Default)]
struct BackendData {
    properties: HashMap<String, OwnedValue>,
    error: Option<CacheError>,
    available: bool,
    /// The unique name of the connection currently owning the service, if known.
    owner: Option<String>,
    /// The in-flight `GetAll`. Dropping it drops the eventual reply.
    load: Option<bussy::Call>,
    watchers: Vec<bussy::SignalHandler>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

struct Subscriber {
    id: u64,
    events: UnboundedSender<BackendEvent>,
}

impl BackendData {
    fn send_reset(&self) {
        for subscriber in &self.subscribers {
            let _ = subscriber.events.send(BackendEvent::Reset {
                properties: clone_properties(&self.properties),
                error: self.error.clone(),
            });
        }
    }

    fn send_changes(&self, values: &HashMap<String, Option<OwnedValue>>) {
        for subscriber in &self.subscribers {
            let _ = subscriber.events.send(BackendEvent::Change {
                values: clone_changes(values),
            });
        }
    }
}

impl Backend {
    /// Subscribes a view and returns its id together with a snapshot of the current
    /// state. Snapshot and subscription happen in one critical section, so the view
    /// cannot miss an event or observe a state that does not match the event stream.
    pub(crate) fn subscribe(
        &self,
        events: UnboundedSender<BackendEvent>,
    ) -> (u64, HashMap<String, OwnedValue>, Option<CacheError>, bool) {
        let mut data = self.data.lock();
        let id = data.next_subscriber;
        data.next_subscriber += 1;
        data.subscribers.push(Subscriber { id, events });
        (
            id,
            clone_properties(&data.properties),
            data.error.clone(),
            data.available,
        )
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.data.lock().subscribers.retain(|s| s.id != id);
    }

    /// Loads the properties with an asynchronous `GetAll`. Idempotent while a load is
    /// in flight. The watchers are installed on the first call and stay installed for
    /// the lifetime of the backend.
    pub(crate) fn load(self: &Arc<Self>) {
        {
            let mut data = self.data.lock();
            if data.watchers.is_empty() {
                self.install_watchers(&mut data);
            }
            if data.load.is_some() {
                return;
            }
        }
        let conn = self.target.bus().connection();
        let backend = Arc::downgrade(self);
        let call = conn.call_async(
            self.target.service(),
            PROPERTIES_INTERFACE,
            self.target.path(),
            GET_ALL,
            &self.target.interface().as_str(),
            move |res: Result<HashMap<String, OwnedValue>, bussy::Error>| {
                if let Some(backend) = backend.upgrade() {
                    backend.load_reply(res);
                }
            },
        );
        self.data.lock().load = Some(call);
    }

    fn install_watchers(self: &Arc<Self>, data: &mut BackendData) {
        let conn = self.target.bus().connection();
        let service = self.target.service().to_string();
        let backend = Arc::downgrade(self);
        let owner_watch = conn.on_name_owner_changed(move |name, _old_owner, new_owner| {
            if name != service {
                return;
            }
            if let Some(backend) = backend.upgrade() {
                backend.service_owner_changed(new_owner);
            }
        });
        let backend = Arc::downgrade(self);
        let change_watch = conn.handle_messages(
            MatchRuleBuilder::default()
                .msg_type(Type::Signal)
                .sender(self.target.service())
                .path(self.target.path())
                .interface(PROPERTIES_INTERFACE)
                .member(PROPERTIES_CHANGED)
                .build(),
            move |msg: &Message,
                  (interface, changed, invalidated): (
                String,
                HashMap<String, OwnedValue>,
                Vec<String>,
            )| {
                let Some(backend) = backend.upgrade() else {
                    return;
                };
                let sender = msg.header().sender().map(|s| s.to_string());
                backend.properties_changed(sender, interface, changed, invalidated);
            },
        );
        data.watchers.push(owner_watch);
        data.watchers.push(change_watch);
        let backend = Arc::downgrade(self);
        let mut owner_call = conn.call_async(
            DBUS_NAME,
            DBUS_INTERFACE,
            DBUS_PATH,
            GET_NAME_OWNER,
            &self.target.service().as_str(),
            move |res: Result<String, bussy::Error>| {
                if let (Some(backend), Ok(owner)) = (backend.upgrade(), res) {
                    backend.data.lock().owner = Some(owner);
                }
            },
        );
        owner_call.detach();
    }

    fn load_reply(&self, res: Result<HashMap<String, OwnedValue>, bussy::Error>) {
        self.data.lock().load = None;
        match res {
            Ok(properties) => {
                log::debug!(
                    "received {} properties from {}",
                    properties.len(),
                    self.target
                );
                self.reset(properties, None);
            }
            Err(e) => {
                let error = CacheError::from_call(e);
                if error.kind() == ErrorKind::ServiceUnknown {
                    log::info!(
                        "service {} is unavailable, waiting to load properties from {}",
                        self.target.service(),
                        self.target
                    );
                } else {
                    log::warn!("loading properties from {} failed: {}", self.target, error);
                }
                self.reset(HashMap::new(), Some(error));
            }
        }
    }

    fn service_owner_changed(self: &Arc<Self>, new_owner: String) {
        {
            let mut data = self.data.lock();
            if data.load.take().is_some() {
                log::debug!(
                    "service owner changed, canceling pending property load from {}",
                    self.target
                );
            }
            data.owner = new_owner.is_not_empty().then(|| new_owner.clone());
        }
        if new_owner.is_empty() {
            log::info!("service disconnected, resetting properties for {}", self.target);
            self.reset(HashMap::new(), Some(CacheError::disconnected()));
        } else {
            log::info!(
                "service is now available, loading properties from {}",
                self.target
            );
            // Give the service a moment to finish registering its objects before the
            // GetAll. Any earlier PropertiesChanged signal triggers an immediate load.
            let backend = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(RELOAD_DELAY).await;
                if let Some(backend) = backend.upgrade() {
                    backend.load();
                }
            });
        }
    }

    fn properties_changed(
        self: &Arc<Self>,
        sender: Option<String>,
        interface: String,
        changed: HashMap<String, OwnedValue>,
        invalidated: Vec<String>,
    ) {
        if interface != self.target.interface().as_str() {
            return;
        }
        let mut data = self.data.lock();
        if let (Some(owner), Some(sender)) = (&data.owner, &sender) {
            if owner != sender {
                return;
            }
        }
        if data.load.is_some() {
            // The values will also be in the pending reply. Emitting here would break
            // the ordering guarantees.
            log::debug!(
                "ignored property change signal while loading properties from {}",
                self.target
            );
            return;
        }
        if !data.available {
            log::debug!(
                "retrying load after receiving unexpected PropertiesChanged from {} \
                 which was unavailable because {:?}",
                self.target,
                data.error
            );
            drop(data);
            self.load();
            return;
        }
        let mut survivors = HashMap::new();
        for (name, value) in changed {
            match data.properties.get(&name) {
                Some(current) if *current == value => {}
                _ => {
                    data.properties.insert(name.clone(), clone_value(&value));
                    survivors.insert(name, Some(value));
                }
            }
        }
        for name in invalidated {
            if data.properties.remove(&name).is_some() {
                survivors.insert(name, None);
            }
        }
        if survivors.is_empty() {
            return;
        }
        data.send_changes(&survivors);
    }

    fn reset(&self, properties: HashMap<String, OwnedValue>, error: Option<CacheError>) {
        let mut data = self.data.lock();
        data.properties = properties;
        data.error = error;
        data.available = data.error.is_none();
        data.send_reset();
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        log::debug!("destroyed backend for {}", self.target);
    }
}
