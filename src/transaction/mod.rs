//! RFC 3261 transaction layer with the RFC 6026 amendments.
//!
//! One [`Transaction`](transaction::Transaction) value plays all four
//! RFC roles (client/server x INVITE/non-INVITE), selected by
//! [`TransactionType`]. The [`endpoint`] module owns the registry that
//! matches incoming messages to live transactions and absorbs
//! retransmissions; [`timer::Timer`] is the shared timer wheel all
//! transactions schedule against.

use rand::Rng;
use rsip::prelude::UntypedHeader;
use std::time::Duration;

pub mod endpoint;
pub mod key;
pub mod sender;
pub mod timer;
pub mod transaction;

pub use endpoint::{Endpoint, EndpointBuilder};
pub use sender::{RequestApplicant, RequestSender};

#[cfg(test)]
mod tests;

/// RTT estimate, the base for all retransmission timers.
pub const T1: Duration = Duration::from_millis(500);
/// Cap on the retransmit interval for non-INVITE requests and INVITE
/// responses.
pub const T2: Duration = Duration::from_secs(4);
/// Maximum time a message stays in the network.
pub const T4: Duration = Duration::from_secs(5);
/// How long T1 doubles before a transaction gives up, 64*T1.
pub const T1X64: Duration = Duration::from_millis(64 * 500);
/// UAS re-sends its latest provisional at this interval so proxies do
/// not believe the transaction died.
pub const TIMER_INTERVAL_PROVISIONAL: Duration = Duration::from_secs(60);

const BRANCH_MAGIC: &str = "z9hG4bK";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransactionState {
    /// Created but not yet sent or attached.
    Idle,
    /// Client INVITE only, before any response.
    Calling,
    Trying,
    Proceeding,
    Completed,
    /// 2xx seen on an INVITE transaction (RFC 6026).
    Accepted,
    /// Server INVITE received the ACK for its non-2xx final.
    Confirmed,
    Terminated,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// Timer identities, RFC 3261 section 17 letters plus the two
/// registry-level ones.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TransactionTimer {
    /// Retransmit: A for client INVITE, E for client non-INVITE, G for
    /// the server INVITE final response. Carries the current interval.
    Retransmit(key::TransactionKey, Duration),
    /// Give-up: B, F, or H depending on the machine.
    Timeout(key::TransactionKey),
    /// Absorption linger: D, I, J, K, and the RFC 6026 L/M accepted
    /// wait.
    Linger(key::TransactionKey),
    /// Server INVITE provisional refresh.
    Provisional(key::TransactionKey),
    /// Drop a finished transaction from the absorption cache.
    Purge(key::TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &key::TransactionKey {
        match self {
            TransactionTimer::Retransmit(key, _)
            | TransactionTimer::Timeout(key)
            | TransactionTimer::Linger(key)
            | TransactionTimer::Provisional(key)
            | TransactionTimer::Purge(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::Retransmit(key, interval) => {
                write!(f, "Retransmit({}, {:?})", key, interval)
            }
            TransactionTimer::Timeout(key) => write!(f, "Timeout({})", key),
            TransactionTimer::Linger(key) => write!(f, "Linger({})", key),
            TransactionTimer::Provisional(key) => write!(f, "Provisional({})", key),
            TransactionTimer::Purge(key) => write!(f, "Purge({})", key),
        }
    }
}

pub fn random_text(count: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(rsip::param::Branch::new(format!(
        "{}{}",
        BRANCH_MAGIC,
        random_text(12)
    )))
}

pub fn make_tag() -> rsip::param::Tag {
    rsip::param::Tag::new(random_text(8))
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    rsip::headers::CallId::new(format!(
        "{}@{}",
        random_text(22),
        domain.unwrap_or("localhost")
    ))
}

pub fn make_cnonce() -> String {
    random_text(8)
}
