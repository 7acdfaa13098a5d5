use super::test_server::{create_channel_endpoint, expect_response};
use crate::transport::TransportEvent;
use rsip::headers::*;
use std::time::Duration;
use tokio::{select, time::sleep};

#[tokio::test]
async fn test_endpoint_serve_shutdown() {
    let endpoint = super::create_test_endpoint(None)
        .await
        .expect("create_test_endpoint");
    select! {
        _ = async {
            sleep(Duration::from_millis(10)).await;
            endpoint.shutdown();
            sleep(Duration::from_secs(1)).await;
        } => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {}
    }
}

#[tokio::test]
async fn test_endpoint_rejects_without_receiver() {
    let (endpoint, mut peer) = create_channel_endpoint().await;

    let request = rsip::Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:127.0.0.1:2025").expect("uri"),
        headers: vec![
            Via::new("SIP/2.0/UDP peer.example.com:5060;branch=z9hG4bKreject1").into(),
            CSeq::new("1 REGISTER").into(),
            From::new("Bob <sip:bob@example.com>;tag=rejecttag").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new("reject@example.com").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };

    let send_loop = async {
        // nobody called incoming_transactions()
        peer.incoming_tx
            .send(TransportEvent::Incoming(
                request.into(),
                peer.connection.clone(),
                peer.addr.clone(),
            ))
            .expect("incoming send");
        let resp = expect_response(&mut peer.outgoing_rx).await;
        assert_eq!(resp.status_code, rsip::StatusCode::ServerInternalError);
    };

    select! {
        _ = send_loop => {}
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(1)) => {
            panic!("timeout waiting");
        }
    }
}
