use {
    crate::{backend, error::ConnectError},
    ahash::AHashMap,
    parking_lot::Mutex,
    std::{
        fmt::{self, Debug, Formatter},
        hash::{Hash, Hasher},
        sync::{Arc, OnceLock},
    },
};

const SESSION_BUS: &str = "session";

/// A named connection to a D-Bus message bus.
///
/// Connections are process-global and identified by name: calling [Bus::session] or
/// [Bus::connect] with a name that is already connected returns the existing
/// connection. Two connections with different names are different bus identities, even
/// when they are connected to the same daemon.
///
/// Cloning is cheap and clones refer to the same connection. Equality and hashing are
/// defined on the connection name alone.
///
/// All bus I/O runs on the shared backend thread, so a [Bus] can be created and used
/// from any thread.
#[derive(Clone)]
pub struct Bus {
    shared: Arc<BusShared>,
}

struct BusShared {
    name: String,
    holder: bussy::ConnectionHolder,
}

static BUSES: OnceLock<Mutex<AHashMap<String, Bus>>> = OnceLock::new();

fn buses() -> &'static Mutex<AHashMap<String, Bus>> {
    BUSES.get_or_init(Default::default)
}

impl Bus {
    /// Returns the default session bus, connecting on first use.
    pub fn session() -> Result<Bus, ConnectError> {
        Self::open(SESSION_BUS, None)
    }

    /// Returns a connection to the bus at `address` under the given name.
    ///
    /// If a connection with this name already exists it is returned as-is, regardless
    /// of its address.
    pub fn connect(address: &str, name: &str) -> Result<Bus, ConnectError> {
        Self::open(name, Some(address.to_string()))
    }

    fn open(name: &str, address: Option<String>) -> Result<Bus, ConnectError> {
        let mut buses = buses().lock();
        if let Some(bus) = buses.get(name) {
            return Ok(bus.clone());
        }
        let holder = backend::block_on(async move {
            let builder = match &address {
                Some(address) => zbus::connection::Builder::address(address.as_str())?,
                None => zbus::connection::Builder::session()?,
            };
            let connection = builder.build().await?;
            Ok::<_, zbus::Error>(bussy::Connection::wrap(&connection))
        })
        .ok_or(ConnectError::BackendStopped)?
        .map_err(ConnectError::Connect)?;
        let bus = Bus {
            shared: Arc::new(BusShared {
                name: name.to_string(),
                holder,
            }),
        };
        buses.insert(name.to_string(), bus.clone());
        Ok(bus)
    }

    /// Drops the named connection from the process-global registry.
    ///
    /// Existing [Bus] clones keep the connection alive; the connection closes once the
    /// last clone is dropped.
    pub fn disconnect(name: &str) {
        buses().lock().remove(name);
    }

    /// Returns the connection name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn connection(&self) -> &Arc<bussy::Connection> {
        &self.shared.holder.connection
    }
}

impl PartialEq for Bus {
    fn eq(&self, other: &Self) -> bool {
        self.shared.name == other.shared.name
    }
}

impl Eq for Bus {}

impl Hash for Bus {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.name.hash(state);
    }
}

impl Debug for Bus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Bus").field(&self.shared.name).finish()
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shared.name)
    }
}
