use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transport::{
    channel::ChannelConnection, SipAddr, SipConnection, TransportEvent, TransportLayer,
};
use crate::Result;
use rsip::headers::*;
use rsip::SipMessage;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

mod test_dialog_layer;
mod test_dialog_states;
mod test_glare;

fn fast_option() -> EndpointOption {
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

pub(super) async fn create_test_endpoint() -> Result<Endpoint> {
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());
    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipflow-test")
        .with_transport_layer(tl)
        .with_timer_interval(Duration::from_millis(5))
        .with_option(fast_option())
        .build();
    Ok(endpoint)
}

pub(super) struct Peer {
    pub(super) incoming_tx: UnboundedSender<TransportEvent>,
    pub(super) outgoing_rx: UnboundedReceiver<TransportEvent>,
    pub(super) connection: SipConnection,
    pub(super) addr: SipAddr,
}

pub(super) async fn create_channel_endpoint() -> (Endpoint, Peer) {
    let token = CancellationToken::new();
    let addr = SipAddr {
        r#type: Some(rsip::transport::Transport::Udp),
        addr: "127.0.0.1:2026".parse::<SocketAddr>().expect("addr").into(),
    };
    let (incoming_tx, incoming_rx) = unbounded_channel();
    let (outgoing_tx, outgoing_rx) = unbounded_channel();
    let connection: SipConnection =
        ChannelConnection::create_connection(incoming_rx, outgoing_tx, addr.clone())
            .await
            .expect("create_connection")
            .into();

    let tl = TransportLayer::new(token.child_token());
    tl.add_transport(connection.clone());

    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipflow-test")
        .with_transport_layer(tl)
        .with_timer_interval(Duration::from_millis(5))
        .with_option(fast_option())
        .build();
    let peer = Peer {
        incoming_tx,
        outgoing_rx,
        connection,
        addr,
    };
    (endpoint, peer)
}

/// Initial INVITE as the remote UAC would send it, Contact included so
/// a server dialog can learn its remote target.
pub(super) fn create_invite_request(
    from_tag: &str,
    to_tag: Option<&str>,
    call_id: &str,
) -> rsip::Request {
    let to = match to_tag {
        Some(tag) => format!("Alice <sip:alice@example.com>;tag={}", tag),
        None => "Alice <sip:alice@example.com>".to_string(),
    };
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:alice@127.0.0.1:2026").expect("uri"),
        headers: vec![
            Via::new("SIP/2.0/UDP peer.example.com:5060;branch=z9hG4bK74bf9").into(),
            CSeq::new("1 INVITE").into(),
            From::new(&format!("Bob <sip:bob@example.com>;tag={}", from_tag)).into(),
            To::new(&to).into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:bob@peer.example.com:5060>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

pub(super) async fn expect_response(rx: &mut UnboundedReceiver<TransportEvent>) -> rsip::Response {
    match rx.recv().await.expect("outgoing event") {
        TransportEvent::Incoming(SipMessage::Response(resp), _, _) => resp,
        _ => panic!("expected response"),
    }
}
