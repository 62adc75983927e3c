pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod message;
pub mod models;

/// Well-known UDP port of the LOOKin protocol, used on both ends.
pub const LOOKIN_PORT: u16 = 61201;

pub use endpoint::{Endpoint, EndpointConfig, EndpointState};
pub use error::{Error, Result, ServiceFault};
pub use http::{HttpTimeouts, LookinClient, Transport};
pub use message::{UdpAlive, UdpEvent, UdpUpdate};
