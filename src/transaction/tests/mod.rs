use super::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::{
    transport::{udp::UdpConnection, TransportLayer},
    Result,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod test_endpoint;
mod test_sender;

/// Shrunk RFC timers so transaction lifetimes fit in a test run.
pub(super) fn fast_option() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(10),
        t2: Duration::from_millis(40),
        t4: Duration::from_millis(20),
        t1x64: Duration::from_millis(200),
        timer_d: Duration::from_millis(50),
        provisional_interval: Duration::from_millis(100),
        callid_suffix: None,
    }
}

pub(super) async fn create_test_endpoint(addr: Option<&str>) -> Result<Endpoint> {
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());

    if let Some(addr) = addr {
        let conn = UdpConnection::create_connection(addr.parse()?, None).await?;
        tl.add_transport(conn.into());
    }

    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipflow-test")
        .with_transport_layer(tl)
        .with_timer_interval(Duration::from_millis(5))
        .with_option(fast_option())
        .build();
    Ok(endpoint)
}

#[cfg(test)]
mod misc {
    use crate::transaction::{make_call_id, make_via_branch, random_text};

    #[test]
    fn test_random_text() {
        let text = random_text(10);
        assert_eq!(text.len(), 10);
        let branch = make_via_branch().to_string();
        // ";branch=z9hG4bK" plus 12 random chars
        assert_eq!(branch.len(), 27);
    }

    #[test]
    fn test_make_call_id() {
        let call_id = make_call_id(Some("example.com")).to_string();
        assert!(call_id.ends_with("@example.com"));
        let call_id = make_call_id(None).to_string();
        assert!(call_id.ends_with("@localhost"));
    }
}
