//! # propsy
//!
//! propsy is a fully asynchronous, process-shared cache for the properties of remote
//! D-Bus objects, built on top of [bussy].
//!
//! It provides the following guarantees:
//!
//! - Properties are loaded automatically and reset when the service connects or
//!   disconnects, even unexpectedly.
//! - Property values are kept up to date from `PropertiesChanged` signals.
//! - Data is shared between [PropertyCache] instances for the same target in the same
//!   process, so creating another instance requires no bus traffic.
//! - Reads never block and never touch the bus.
//! - The cache is never in a partially-initialized state: signals are emitted in a
//!   strict documented order, changes from a single bus message are applied
//!   atomically, and instances on the same thread always agree on the data.
//!
//! Note the following caveats:
//!
//! - A [PropertyCache] belongs to the thread that created it, and that thread must run
//!   an event loop (a current-thread tokio runtime driving a
//!   [tokio::task::LocalSet]).
//! - Writes are requests: [PropertyCache::set] does not update the cached value. The
//!   value changes once the service emits the resulting `PropertiesChanged` signal.
//!
//! # Example
//!
//! ```rust,no_run
//! # fn f() -> Result<(), Box<dyn std::error::Error>> {
//! use zbus::names::{BusName, InterfaceName};
//! use zbus::zvariant::ObjectPath;
//!
//! let bus = propsy::Bus::session()?;
//! let target = propsy::Target::new(
//!     &bus,
//!     BusName::try_from("org.example.Service")?,
//!     ObjectPath::try_from("/org/example/Service")?,
//!     InterfaceName::try_from("org.example.Service")?,
//! );
//! let cache = propsy::PropertyCache::new(&target);
//! cache.on_ready(|_| println!("properties are available"));
//! cache.on_property_changed(|_, name, value| println!("{name} changed to {value:?}"));
//! cache.initialize();
//! # Ok(())
//! # }
//! ```

mod backend;
mod bus;
mod cache;
mod error;
mod target;
mod view;

pub mod testing;

pub use {
    backend::shutdown,
    bus::Bus,
    cache::PropertyCache,
    error::{CacheError, ConnectError, ErrorKind},
    target::Target,
};
