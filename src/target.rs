use {
    crate::bus::Bus,
    std::fmt::{self, Debug, Display, Formatter},
    zbus::{
        names::{BusName, InterfaceName},
        zvariant::ObjectPath,
    },
};

/// The target of property traffic: a `(bus, service, path, interface)` tuple.
///
/// Target is the sharing key of the cache: [PropertyCache](crate::PropertyCache)
/// instances with equal targets share their data. Equality and hashing cover the bus
/// name and all three address fields.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Target {
    bus: Bus,
    service: BusName<'static>,
    path: ObjectPath<'static>,
    interface: InterfaceName<'static>,
}

impl Target {
    /// Creates a target with an explicit bus, service, path, and interface.
    pub fn new(
        bus: &Bus,
        service: impl Into<BusName<'static>>,
        path: impl Into<ObjectPath<'static>>,
        interface: impl Into<InterfaceName<'static>>,
    ) -> Self {
        Self {
            bus: bus.clone(),
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
        }
    }

    /// Returns the bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Returns the service name.
    pub fn service(&self) -> &BusName<'static> {
        &self.service
    }

    /// Returns the object path.
    pub fn path(&self) -> &ObjectPath<'static> {
        &self.path
    }

    /// Returns the interface name.
    pub fn interface(&self) -> &InterfaceName<'static> {
        &self.interface
    }

    /// Returns a new target for `path` with the same bus, service, and interface.
    pub fn with_path(&self, path: impl Into<ObjectPath<'static>>) -> Self {
        Self {
            bus: self.bus.clone(),
            service: self.service.clone(),
            path: path.into(),
            interface: self.interface.clone(),
        }
    }

    /// Returns a new target for `interface` with the same bus, service, and path.
    pub fn with_interface(&self, interface: impl Into<InterfaceName<'static>>) -> Self {
        Self {
            bus: self.bus.clone(),
            service: self.service.clone(),
            path: self.path.clone(),
            interface: interface.into(),
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DBus({}, {}, {}, {})",
            self.bus.name(),
            self.service,
            self.path,
            self.interface
        )
    }
}

impl Debug for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
