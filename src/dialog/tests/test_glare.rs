use super::{create_invite_request, create_test_endpoint};
use crate::dialog::dialog::DialogInner;
use crate::dialog::DialogId;
use crate::transaction::key::TransactionRole;
use rsip::headers::*;
use rsip::{Header, Method, StatusCode};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc::unbounded_channel;

fn in_dialog_request(method: Method, cseq: u32) -> rsip::Request {
    rsip::Request {
        method,
        uri: rsip::Uri::try_from("sip:alice@127.0.0.1:2026").expect("uri"),
        headers: vec![
            Via::new("SIP/2.0/UDP peer.example.com:5060;branch=z9hG4bKglare1").into(),
            CSeq::new(format!("{} {}", cseq, method)).into(),
            From::new("Bob <sip:bob@example.com>;tag=from-tag-1").into(),
            To::new("Alice <sip:alice@example.com>;tag=to-tag-1").into(),
            CallId::new("glare@example.com").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

async fn create_server_inner() -> DialogInner {
    let endpoint = create_test_endpoint().await.expect("endpoint");
    let request = create_invite_request("from-tag-1", None, "glare@example.com");
    let mut id = DialogId::try_from(&request).expect("dialog id");
    id.to_tag = "to-tag-1".to_string();
    let (state_tx, _state_rx) = unbounded_channel();
    DialogInner::new(
        TransactionRole::Server,
        id,
        request,
        endpoint.inner.clone(),
        state_tx,
        None,
        None,
    )
    .expect("dialog inner")
}

#[tokio::test]
async fn test_out_of_order_cseq() {
    let inner = create_server_inner().await;

    // first in-dialog request sets the high-water mark
    let bye = in_dialog_request(Method::Bye, 5);
    assert!(inner.check_in_dialog_request(&bye).expect("check").is_none());
    assert_eq!(inner.remote_seq.load(Ordering::SeqCst), 5);

    // stale CSeq is rejected
    let stale = in_dialog_request(Method::Bye, 3);
    let rejection = inner
        .check_in_dialog_request(&stale)
        .expect("check")
        .expect("rejection");
    assert_eq!(rejection.0, StatusCode::ServerInternalError);

    // ACK and CANCEL are exempt from the ordering check
    let ack = in_dialog_request(Method::Ack, 3);
    assert!(inner.check_in_dialog_request(&ack).expect("check").is_none());
    let cancel = in_dialog_request(Method::Cancel, 3);
    assert!(inner
        .check_in_dialog_request(&cancel)
        .expect("check")
        .is_none());
    assert_eq!(inner.remote_seq.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_glare_uac_pending() {
    let inner = create_server_inner().await;
    inner.uac_pending_reply.store(true, Ordering::SeqCst);

    let reinvite = in_dialog_request(Method::Invite, 6);
    let rejection = inner
        .check_in_dialog_request(&reinvite)
        .expect("check")
        .expect("rejection");
    assert_eq!(rejection.0, StatusCode::RequestPending);

    // the 491 must not consume the CSeq; the peer retries the same
    // number once the glare clears
    assert_eq!(inner.remote_seq.load(Ordering::SeqCst), 0);
    inner.uac_pending_reply.store(false, Ordering::SeqCst);
    assert!(inner
        .check_in_dialog_request(&reinvite)
        .expect("check")
        .is_none());
    assert_eq!(inner.remote_seq.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_glare_uas_pending() {
    let inner = create_server_inner().await;
    inner.uas_pending_reply.store(true, Ordering::SeqCst);

    let reinvite = in_dialog_request(Method::Invite, 6);
    let (status, headers) = inner
        .check_in_dialog_request(&reinvite)
        .expect("check")
        .expect("rejection");
    assert_eq!(status, StatusCode::ServerInternalError);
    // the 500 consumes the CSeq, a retry needs a fresh number
    assert_eq!(inner.remote_seq.load(Ordering::SeqCst), 6);

    let retry_after = headers
        .iter()
        .find_map(|h| match h {
            Header::Other(name, value) if name == "Retry-After" => value.parse::<u32>().ok(),
            _ => None,
        })
        .expect("Retry-After header");
    assert!((1..=10).contains(&retry_after));
}
