pub mod channel;
pub mod connection;
pub mod sip_addr;
pub mod transport_layer;
pub mod udp;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};
pub use sip_addr::SipAddr;
pub use transport_layer::TransportLayer;

pub(crate) const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub(crate) const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";
