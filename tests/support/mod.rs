//! Test harness: a private dbus-daemon instance and mock services on their own
//! threads.

#![allow(dead_code)]

use {
    parking_lot::Mutex,
    std::{
        cell::RefCell,
        collections::HashMap,
        future::Future,
        io::{BufRead, BufReader},
        path::PathBuf,
        process::{Child, Command, Stdio},
        rc::Rc,
        sync::{mpsc as std_mpsc, Arc},
        time::Duration,
    },
    zbus::{
        names::{InterfaceName, MemberName, WellKnownName},
        zvariant::{ObjectPath, OwnedValue, Value},
    },
};

pub const TEST_SERVICE: WellKnownName<'static> =
    WellKnownName::from_static_str_unchecked("test.service");
pub const TEST_PATH: ObjectPath<'static> =
    ObjectPath::from_static_str_unchecked("/test/service");
pub const TEST_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("test.service");

const PROPERTIES_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("org.freedesktop.DBus.Properties");
const PROPERTIES_CHANGED: MemberName<'static> =
    MemberName::from_static_str_unchecked("PropertiesChanged");
const GET_ALL: MemberName<'static> = MemberName::from_static_str_unchecked("GetAll");
const SET: MemberName<'static> = MemberName::from_static_str_unchecked("Set");
const GET_ID: MemberName<'static> = MemberName::from_static_str_unchecked("GetId");
const DBUS_NAME: WellKnownName<'static> =
    WellKnownName::from_static_str_unchecked("org.freedesktop.DBus");
const DBUS_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("org.freedesktop.DBus");
const DBUS_PATH: ObjectPath<'static> =
    ObjectPath::from_static_str_unchecked("/org/freedesktop/DBus");

const DAEMON_CONFIG: &str = r#"<busconfig>
  <type>session</type>
  <listen>unix:tmpdir=/tmp</listen>
  <policy context="default">
    <allow send_destination="*"/>
    <allow eavesdrop="true"/>
    <allow own="*"/>
  </policy>
</busconfig>"#;

// The backend registry and its unused-backend cache are process state, so tests run
// one at a time.
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// A private dbus-daemon instance plus a client connection and a runtime for the test
/// body. Dropping it verifies that no backend leaked, then tears everything down.
pub struct TestEnv {
    rt: Option<tokio::runtime::Runtime>,
    daemon: Child,
    dir: PathBuf,
    address: String,
    client_name: String,
    client: propsy::Bus,
    _lock: parking_lot::MutexGuard<'static, ()>,
}

impl TestEnv {
    /// Starts a new private daemon. Returns `None` if dbus-daemon is not installed,
    /// in which case the test should be skipped.
    pub fn new() -> Option<TestEnv> {
        let _ = env_logger::builder().is_test(true).try_init();
        let lock = TEST_LOCK.lock();
        let dir = std::env::temp_dir().join(format!("propsy-test-{:08x}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = dir.join("dbus-config.xml");
        std::fs::write(&config, DAEMON_CONFIG).unwrap();
        let socket = dir.join("dbus-socket");
        let mut daemon = match Command::new("dbus-daemon")
            .arg("--print-address")
            .arg("--nosyslog")
            .arg(format!("--config-file={}", config.display()))
            .arg(format!("--address=unix:path={}", socket.display()))
            .stdout(Stdio::piped())
            .spawn()
        {
            Ok(daemon) => daemon,
            Err(_) => {
                eprintln!("dbus-daemon is not available, skipping");
                let _ = std::fs::remove_dir_all(&dir);
                return None;
            }
        };
        let mut address = String::new();
        BufReader::new(daemon.stdout.take().unwrap())
            .read_line(&mut address)
            .unwrap();
        let address = address.trim().to_string();
        assert!(address.starts_with("unix:"), "bad bus address: {address}");
        let client_name = format!("test-client-{:08x}", rand::random::<u32>());
        let client = propsy::Bus::connect(&address, &client_name).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        Some(TestEnv {
            rt: Some(rt),
            daemon,
            dir,
            address,
            client_name,
            client,
            _lock: lock,
        })
    }

    /// Returns the client bus for this test.
    pub fn client(&self) -> &propsy::Bus {
        &self.client
    }

    /// Returns the daemon's socket address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Runs the test body inside a LocalSet on the test's event loop.
    pub fn run<F: Future<Output = ()>>(&self, future: F) {
        let local = tokio::task::LocalSet::new();
        self.rt.as_ref().unwrap().block_on(local.run_until(future));
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        propsy::testing::clear_unused();
        if !std::thread::panicking() {
            assert!(
                propsy::testing::backends_empty(),
                "a backend leaked out of the test"
            );
        }
        propsy::Bus::disconnect(&self.client_name);
        drop(self.rt.take());
        let _ = self.daemon.kill();
        let _ = self.daemon.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

type ServiceJob<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Runs a mock-service controller on a dedicated thread with its own connection.
///
/// The controller is created by `init` on the service thread and can only be reached
/// through [Self::invoke] and [Self::sync]. The constructor returns once the daemon
/// has processed everything the controller queued, so names requested by the
/// controller are guaranteed to be owned. Dropping the service destroys the
/// controller, closes the connection, and joins the thread.
pub struct TestService<C> {
    jobs: Option<tokio::sync::mpsc::UnboundedSender<ServiceJob<C>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl<C: 'static> TestService<C> {
    pub fn start<F>(address: &str, init: F) -> TestService<C>
    where
        F: FnOnce(Arc<bussy::Connection>) -> C + Send + 'static,
    {
        let address = address.to_string();
        let (jobs, mut queue) = tokio::sync::mpsc::unbounded_channel::<ServiceJob<C>>();
        let (ready, ready_recv) = std_mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("test-service".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async move {
                    let connection = zbus::connection::Builder::address(address.as_str())
                        .unwrap()
                        .build()
                        .await
                        .unwrap();
                    let holder = bussy::Connection::wrap(&connection);
                    let mut controller = init(holder.connection.clone());
                    // Round-trip to the daemon so that everything the controller
                    // queued has been processed before the constructor returns.
                    let (ping, pong) = tokio::sync::oneshot::channel();
                    holder
                        .connection
                        .call_async(
                            DBUS_NAME,
                            DBUS_INTERFACE,
                            DBUS_PATH,
                            GET_ID,
                            &(),
                            move |_: Result<String, bussy::Error>| {
                                let _ = ping.send(());
                            },
                        )
                        .detach();
                    pong.await.unwrap();
                    ready.send(()).unwrap();
                    while let Some(job) = queue.recv().await {
                        job(&mut controller);
                    }
                    drop(controller);
                });
            })
            .unwrap();
        ready_recv.recv().unwrap();
        TestService {
            jobs: Some(jobs),
            thread: Some(thread),
        }
    }

    /// Queues a call of `f` on the service thread and returns immediately.
    pub fn invoke(&self, f: impl FnOnce(&mut C) + Send + 'static) {
        self.jobs.as_ref().unwrap().send(Box::new(f)).unwrap();
    }

    /// Calls `f` on the service thread and waits for its result.
    pub fn sync<R: Send + 'static>(&self, f: impl FnOnce(&mut C) -> R + Send + 'static) -> R {
        let (send, recv) = std_mpsc::channel();
        self.invoke(move |c| {
            let _ = send.send(f(c));
        });
        recv.recv().unwrap()
    }
}

impl<C> Drop for TestService<C> {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct ServiceState {
    properties: HashMap<String, OwnedValue>,
    get_all_count: u32,
}

/// The mock service: owns `test.service` and exposes a `str` property plus the
/// `org.freedesktop.DBus.Properties` methods on `/test/service`.
pub struct PropertyService {
    conn: Arc<bussy::Connection>,
    state: Arc<Mutex<ServiceState>>,
    object: Option<Arc<bussy::Object>>,
}

impl PropertyService {
    pub fn new(conn: Arc<bussy::Connection>) -> Self {
        let mut service = Self::without_object(conn);
        service.register_object();
        service
    }

    /// Owns the service name but does not register the object yet.
    pub fn without_object(conn: Arc<bussy::Connection>) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "str".to_string(),
            Value::from("hello").try_to_owned().unwrap(),
        );
        conn.request_name(TEST_SERVICE);
        Self {
            conn,
            state: Arc::new(Mutex::new(ServiceState {
                properties,
                get_all_count: 0,
            })),
            object: None,
        }
    }

    pub fn register_object(&mut self) {
        let object = self.conn.add_obj(TEST_PATH);
        let state = self.state.clone();
        object.add_method(
            PROPERTIES_INTERFACE,
            GET_ALL,
            move |interface: String, mut pr: bussy::PendingReply| {
                let mut state = state.lock();
                let mut dict = HashMap::new();
                if interface == TEST_INTERFACE.as_str() {
                    state.get_all_count += 1;
                    for (name, value) in &state.properties {
                        dict.insert(name.as_str(), &**value);
                    }
                }
                pr.send(&dict);
            },
        );
        let state = self.state.clone();
        let conn = self.conn.clone();
        object.add_method(
            PROPERTIES_INTERFACE,
            SET,
            move |(interface, name, value): (String, String, OwnedValue),
                  mut pr: bussy::PendingReply| {
                {
                    let mut state = state.lock();
                    if interface != TEST_INTERFACE.as_str()
                        || !state.properties.contains_key(&name)
                    {
                        pr.send_err(
                            "org.freedesktop.DBus.Error.InvalidArgs",
                            "No such property",
                        );
                        return;
                    }
                    state
                        .properties
                        .insert(name.clone(), value.try_clone().unwrap());
                }
                let mut changed = HashMap::new();
                changed.insert(name.as_str(), &*value);
                conn.send_signal(
                    PROPERTIES_INTERFACE,
                    TEST_PATH,
                    PROPERTIES_CHANGED,
                    &(TEST_INTERFACE.as_str(), &changed, Vec::<&str>::new()),
                );
                pr.send(&());
            },
        );
        self.object = Some(object);
    }

    /// Sets a property and emits PropertiesChanged, even if the value is unchanged.
    pub fn set_property(&self, name: &str, value: Value<'static>) {
        self.state
            .lock()
            .properties
            .insert(name.to_string(), value.try_to_owned().unwrap());
        self.emit_changed(&[(name, &value)]);
    }

    pub fn set_str(&self, value: &str) {
        self.set_property("str", Value::from(value.to_string()));
    }

    /// Changes two properties with a single PropertiesChanged signal.
    pub fn set_both(&self, variant: Value<'static>, s: &str) {
        let str_value = Value::from(s.to_string());
        {
            let mut state = self.state.lock();
            state
                .properties
                .insert("variant".to_string(), variant.try_to_owned().unwrap());
            state
                .properties
                .insert("str".to_string(), str_value.try_to_owned().unwrap());
        }
        self.emit_changed(&[("variant", &variant), ("str", &str_value)]);
    }

    /// Emits a PropertiesChanged signal without touching the stored properties.
    pub fn emit_raw(&self, values: &[(&str, &Value)]) {
        self.emit_changed(values);
    }

    /// Drops a property and announces it through the invalidated list.
    pub fn invalidate(&self, name: &str) {
        self.state.lock().properties.remove(name);
        let changed: HashMap<&str, &Value> = HashMap::new();
        self.conn.send_signal(
            PROPERTIES_INTERFACE,
            TEST_PATH,
            PROPERTIES_CHANGED,
            &(TEST_INTERFACE.as_str(), &changed, vec![name]),
        );
    }

    pub fn get_all_count(&self) -> u32 {
        self.state.lock().get_all_count
    }

    fn emit_changed(&self, values: &[(&str, &Value)]) {
        let changed: HashMap<&str, &Value> = values.iter().copied().collect();
        self.conn.send_signal(
            PROPERTIES_INTERFACE,
            TEST_PATH,
            PROPERTIES_CHANGED,
            &(TEST_INTERFACE.as_str(), &changed, Vec::<&str>::new()),
        );
    }
}

/// Records values delivered to callbacks.
pub struct Spy<T> {
    events: Rc<RefCell<Vec<T>>>,
}

impl<T> Spy<T> {
    pub fn new() -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn push(&self, value: T) {
        self.events.borrow_mut().push(value);
    }

    pub fn count(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut self.events.borrow_mut())
    }
}

impl<T: Clone> Spy<T> {
    pub fn values(&self) -> Vec<T> {
        self.events.borrow().clone()
    }
}

impl<T> Clone for Spy<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

/// Polls `condition` on the event loop until it holds, panicking after 5 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition was not reached within 5 seconds"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
