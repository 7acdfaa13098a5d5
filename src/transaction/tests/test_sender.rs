use super::test_server::create_channel_endpoint;
use crate::dialog::authenticate::Credential;
use crate::transaction::sender::{RequestApplicant, RequestSender};
use crate::transport::TransportEvent;
use async_trait::async_trait;
use rsip::headers::*;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Response, SipMessage, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::{select, sync::mpsc::UnboundedReceiver, time::sleep};

#[derive(Default)]
struct Recorder {
    statuses: Mutex<Vec<StatusCode>>,
    timed_out: AtomicBool,
}

#[async_trait]
impl RequestApplicant for Recorder {
    async fn receive_response(&self, resp: &Response) {
        self.statuses
            .lock()
            .unwrap()
            .push(resp.status_code.clone());
    }

    async fn on_request_timeout(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }
}

fn register_request(branch: &str, call_id: &str) -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:127.0.0.1:2025").expect("uri"),
        headers: vec![
            Via::new(&format!("SIP/2.0/UDP peer.example.com:5060;branch={}", branch)).into(),
            CSeq::new("1 REGISTER").into(),
            From::new("Bob <sip:bob@example.com>;tag=sendertag").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new(call_id).into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

async fn next_request(rx: &mut UnboundedReceiver<TransportEvent>) -> rsip::Request {
    loop {
        match rx.recv().await.expect("outgoing event") {
            TransportEvent::Incoming(SipMessage::Request(req), _, _) => return req,
            _ => continue,
        }
    }
}

fn reply(req: &rsip::Request, status: StatusCode, extra: Option<rsip::Header>) -> Response {
    let mut headers = req.headers.clone();
    if let Some(header) = extra {
        headers.push(header);
    }
    Response {
        version: rsip::Version::V2,
        status_code: status,
        headers,
        body: Default::default(),
    }
}

#[tokio::test]
async fn test_request_sender_final_response() {
    let (endpoint, mut peer) = create_channel_endpoint().await;

    let peer_loop = async {
        let req = next_request(&mut peer.outgoing_rx).await;
        peer.incoming_tx
            .send(TransportEvent::Incoming(
                reply(&req, StatusCode::Trying, None).into(),
                peer.connection.clone(),
                peer.addr.clone(),
            ))
            .expect("send trying");
        peer.incoming_tx
            .send(TransportEvent::Incoming(
                reply(&req, StatusCode::OK, None).into(),
                peer.connection.clone(),
                peer.addr.clone(),
            ))
            .expect("send ok");
        sleep(Duration::from_secs(2)).await;
    };

    let sender_loop = async {
        let recorder = Recorder::default();
        let mut sender = RequestSender::new(endpoint.inner.clone(), None);
        let resp = sender
            .send(register_request("z9hG4bKsender1", "sender1@example.com"), &recorder)
            .await
            .expect("send")
            .expect("final response");
        assert_eq!(resp.status_code, StatusCode::OK);
        // 100 Trying is not surfaced to the applicant
        assert_eq!(*recorder.statuses.lock().unwrap(), vec![StatusCode::OK]);
    };

    select! {
        _ = sender_loop => {}
        _ = peer_loop => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(1)) => {
            panic!("timeout waiting");
        }
    }
}

#[tokio::test]
async fn test_request_sender_digest_retry() {
    let (endpoint, mut peer) = create_channel_endpoint().await;

    let peer_loop = async {
        let req = next_request(&mut peer.outgoing_rx).await;
        assert!(!req
            .headers
            .iter()
            .any(|h| matches!(h, rsip::Header::Authorization(_))));
        let challenge = WwwAuthenticate::new(
            r#"Digest realm="example.com", nonce="abc123", algorithm=MD5"#,
        );
        peer.incoming_tx
            .send(TransportEvent::Incoming(
                reply(&req, StatusCode::Unauthorized, Some(challenge.into())).into(),
                peer.connection.clone(),
                peer.addr.clone(),
            ))
            .expect("send 401");

        // retried request carries credentials and a bumped CSeq
        let retried = next_request(&mut peer.outgoing_rx).await;
        assert!(retried
            .headers
            .iter()
            .any(|h| matches!(h, rsip::Header::Authorization(_))));
        let cseq = retried
            .cseq_header()
            .expect("cseq")
            .typed()
            .expect("typed cseq");
        assert_eq!(cseq.seq, 2);
        // the retry is a new transaction on a fresh branch
        let via = retried.via_header().expect("via").to_string();
        assert!(!via.contains("z9hG4bKsender2"));

        peer.incoming_tx
            .send(TransportEvent::Incoming(
                reply(&retried, StatusCode::OK, None).into(),
                peer.connection.clone(),
                peer.addr.clone(),
            ))
            .expect("send 200");
        sleep(Duration::from_secs(2)).await;
    };

    let sender_loop = async {
        let recorder = Recorder::default();
        let credential = Credential {
            username: "bob".to_string(),
            password: "secret".to_string(),
            realm: Some("example.com".to_string()),
        };
        let mut sender = RequestSender::new(endpoint.inner.clone(), Some(credential));
        let resp = sender
            .send(register_request("z9hG4bKsender2", "sender2@example.com"), &recorder)
            .await
            .expect("send")
            .expect("final response");
        assert_eq!(resp.status_code, StatusCode::OK);
    };

    select! {
        _ = sender_loop => {}
        _ = peer_loop => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(1)) => {
            panic!("timeout waiting");
        }
    }
}

#[tokio::test]
async fn test_request_sender_gives_up_after_second_challenge() {
    let (endpoint, mut peer) = create_channel_endpoint().await;

    let peer_loop = async {
        for _ in 0..2 {
            let req = next_request(&mut peer.outgoing_rx).await;
            let challenge = WwwAuthenticate::new(
                r#"Digest realm="example.com", nonce="abc123", algorithm=MD5"#,
            );
            peer.incoming_tx
                .send(TransportEvent::Incoming(
                    reply(&req, StatusCode::Unauthorized, Some(challenge.into())).into(),
                    peer.connection.clone(),
                    peer.addr.clone(),
                ))
                .expect("send 401");
        }
        sleep(Duration::from_secs(2)).await;
    };

    let sender_loop = async {
        let recorder = Recorder::default();
        let credential = Credential {
            username: "bob".to_string(),
            password: "wrong".to_string(),
            realm: Some("example.com".to_string()),
        };
        let mut sender = RequestSender::new(endpoint.inner.clone(), Some(credential));
        let resp = sender
            .send(register_request("z9hG4bKsender3", "sender3@example.com"), &recorder)
            .await
            .expect("send")
            .expect("final response");
        // a second non-stale challenge is final, no retry loop
        assert_eq!(resp.status_code, StatusCode::Unauthorized);
        assert_eq!(
            *recorder.statuses.lock().unwrap(),
            vec![StatusCode::Unauthorized]
        );
    };

    select! {
        _ = sender_loop => {}
        _ = peer_loop => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(1)) => {
            panic!("timeout waiting");
        }
    }
}

#[tokio::test]
async fn test_request_sender_timeout_callback() {
    let (endpoint, mut peer) = create_channel_endpoint().await;

    let peer_loop = async {
        let req = next_request(&mut peer.outgoing_rx).await;
        peer.incoming_tx
            .send(TransportEvent::Incoming(
                reply(&req, StatusCode::RequestTimeout, None).into(),
                peer.connection.clone(),
                peer.addr.clone(),
            ))
            .expect("send 408");
        sleep(Duration::from_secs(2)).await;
    };

    let sender_loop = async {
        let recorder = Recorder::default();
        let mut sender = RequestSender::new(endpoint.inner.clone(), None);
        let resp = sender
            .send(register_request("z9hG4bKsender4", "sender4@example.com"), &recorder)
            .await
            .expect("send")
            .expect("final response");
        assert_eq!(resp.status_code, StatusCode::RequestTimeout);
        assert!(recorder.timed_out.load(Ordering::SeqCst));
    };

    select! {
        _ = sender_loop => {}
        _ = peer_loop => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(1)) => {
            panic!("timeout waiting");
        }
    }
}
