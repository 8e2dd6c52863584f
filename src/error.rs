use thiserror::Error;

const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";

/// The reason a [PropertyCache](crate::PropertyCache) is unavailable.
///
/// This is a closed set. Anything that is not a missing service or a missing object is
/// reported as [CacheError::Other] with the bus-level error text.
#[derive(Clone, Debug, Error)]
pub enum CacheError {
    /// No process currently owns the service name.
    #[error("The service is not running: {0}")]
    ServiceUnknown(String),
    /// The service is running but the object or interface does not exist.
    #[error("The object or interface does not exist: {0}")]
    UnknownObject(String),
    /// Any other bus-level failure.
    #[error("{0}")]
    Other(String),
}

/// The kind of a [CacheError], used to compare errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    ServiceUnknown,
    UnknownObject,
    Other,
}

impl CacheError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::ServiceUnknown(_) => ErrorKind::ServiceUnknown,
            CacheError::UnknownObject(_) => ErrorKind::UnknownObject,
            CacheError::Other(_) => ErrorKind::Other,
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        match self {
            CacheError::ServiceUnknown(m) => m,
            CacheError::UnknownObject(m) => m,
            CacheError::Other(m) => m,
        }
    }

    pub(crate) fn from_call(error: bussy::Error) -> Self {
        match error {
            bussy::Error::ErrorReply(name, message) => match name.as_str() {
                SERVICE_UNKNOWN | NAME_HAS_NO_OWNER => CacheError::ServiceUnknown(message),
                UNKNOWN_OBJECT | UNKNOWN_INTERFACE => CacheError::UnknownObject(message),
                _ => CacheError::Other(format!("{name}: {message}")),
            },
            e => CacheError::Other(e.to_string()),
        }
    }

    pub(crate) fn disconnected() -> Self {
        CacheError::ServiceUnknown("The service disconnected".to_string())
    }
}

pub(crate) fn error_kind(error: &Option<CacheError>) -> Option<ErrorKind> {
    error.as_ref().map(|e| e.kind())
}

/// An error returned when a [Bus](crate::Bus) connection cannot be established.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The backend thread has been shut down.
    #[error("The backend thread is not running")]
    BackendStopped,
    /// The connection to the bus failed.
    #[error("Could not connect to the bus")]
    Connect(#[source] zbus::Error),
}
