use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a reachable device could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceFault {
    /// HTTP status outside of 200, 201 and 204.
    UnexpectedStatus(u16),
    /// Body was not the JSON document the endpoint promises.
    MalformedPayload(String),
}

impl std::fmt::Display for ServiceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceFault::UnexpectedStatus(status) => write!(f, "unexpected status {status}"),
            ServiceFault::MalformedPayload(reason) => write!(f, "malformed payload: {reason}"),
        }
    }
}

/// Errors surfaced by the LOOKin protocol layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The endpoint was closed; the instance is no longer usable.
    #[error("endpoint is closed")]
    EndpointClosed,

    /// The device could not be reached (refused, timed out, unresolvable).
    #[error("device not found at {url}: {source}")]
    DeviceNotFound {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The device answered, but not with something usable.
    #[error("no usable service at {url}: {reason}")]
    NoUsableService { url: String, reason: ServiceFault },

    #[error("failed to bind UDP socket: {0}")]
    Bind(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("datagram text must be ASCII")]
    NotAscii,

    /// Climate status only carries 16..=30 degrees Celsius.
    #[error("temperature {0}°C is outside the supported 16..=30°C range")]
    TemperatureOutOfRange(u8),
}

impl Error {
    /// Whether the failure is worth retrying later (device maybe offline).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DeviceNotFound { .. })
    }
}
