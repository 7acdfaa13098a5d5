//! SIP transaction and dialog state machines.
//!
//! `sipflow` implements the reliability core of a SIP user agent: the five
//! RFC 3261/RFC 6026 transaction state machines with their retransmission
//! timers, the transaction registry that detects and absorbs retransmissions,
//! a request sender that resolves digest authentication challenges, and the
//! dialog layer that sequences in-dialog requests and resolves glare
//! (RFC 3261 section 14.1).
//!
//! Message parsing is delegated to [rsip]; the transport is a thin pluggable
//! byte pump (the `transport` module ships a UDP connection plus an
//! in-process channel connection used by the tests).

pub mod dialog;
pub mod error;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;

pub use error::Error;
pub use transaction::endpoint::EndpointBuilder;

pub type Result<T> = std::result::Result<T, Error>;
