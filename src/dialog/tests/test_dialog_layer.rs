use super::{create_invite_request, create_test_endpoint};
use crate::dialog::dialog_layer::DialogLayer;
use crate::dialog::DialogId;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use rsip::headers::*;
#[allow(unused_imports)]
use rsip::prelude::HeadersExt;
use tokio::sync::mpsc::unbounded_channel;

#[tokio::test]
async fn test_create_server_dialog() {
    let endpoint = create_test_endpoint().await.expect("endpoint");
    let dialog_layer = DialogLayer::new(endpoint.inner.clone());
    let (state_tx, _state_rx) = unbounded_channel();

    let request = create_invite_request("from-tag-1", None, "layer-1@example.com");
    let key = TransactionKey::from_request(&request, TransactionRole::Server).expect("key");
    let tx = Transaction::new_server(key, request, endpoint.inner.clone(), None);

    let dialog = dialog_layer
        .get_or_create_server_invite(&tx, state_tx, None, None)
        .expect("server dialog");
    let id = dialog.id();
    assert!(!id.to_tag.is_empty());
    assert_eq!(dialog_layer.len(), 1);

    // lookups work from either side's view of the dialog
    assert!(dialog_layer.get_dialog(&id).is_some());
    assert!(dialog_layer.get_dialog(&id.swapped()).is_some());

    // CANCEL carries no to-tag but still matches
    let cancel = rsip::Request {
        method: rsip::Method::Cancel,
        uri: rsip::Uri::try_from("sip:alice@127.0.0.1:2026").expect("uri"),
        headers: vec![
            Via::new("SIP/2.0/UDP peer.example.com:5060;branch=z9hG4bKcancel1").into(),
            CSeq::new("1 CANCEL").into(),
            From::new("Bob <sip:bob@example.com>;tag=from-tag-1").into(),
            To::new("Alice <sip:alice@example.com>").into(),
            CallId::new("layer-1@example.com").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };
    assert!(dialog_layer.match_dialog(&cancel).is_some());

    dialog_layer.remove_dialog(&id);
    assert!(dialog_layer.is_empty());
    assert!(dialog_layer.get_dialog(&id).is_none());
}

#[tokio::test]
async fn test_server_dialog_unknown_to_tag() {
    let endpoint = create_test_endpoint().await.expect("endpoint");
    let dialog_layer = DialogLayer::new(endpoint.inner.clone());
    let (state_tx, _state_rx) = unbounded_channel();

    // an in-dialog INVITE for a dialog we never created
    let request = create_invite_request("from-tag-1", Some("to-tag-unknown"), "layer-2@example.com");
    let key = TransactionKey::from_request(&request, TransactionRole::Server).expect("key");
    let tx = Transaction::new_server(key, request, endpoint.inner.clone(), None);

    assert!(dialog_layer
        .get_or_create_server_invite(&tx, state_tx, None, None)
        .is_err());
    assert!(dialog_layer.is_empty());
}

#[tokio::test]
async fn test_create_client_dialog() {
    let endpoint = create_test_endpoint().await.expect("endpoint");
    let dialog_layer = DialogLayer::new(endpoint.inner.clone());
    let (state_tx, _state_rx) = unbounded_channel();

    // no from-tag on the outgoing INVITE, the layer mints one
    let mut request = create_invite_request("ignored", None, "layer-3@example.com");
    request
        .headers
        .unique_push(From::new("Bob <sip:bob@example.com>").into());

    let dialog = dialog_layer
        .create_client_invite(request, state_tx, None, None)
        .expect("client dialog");
    let id = dialog.id();
    assert!(!id.from_tag.is_empty());
    assert!(id.to_tag.is_empty());
    assert_eq!(dialog_layer.len(), 1);
    assert!(dialog_layer.get_dialog(&id).is_some());
}

#[tokio::test]
async fn test_last_seq() {
    let endpoint = create_test_endpoint().await.expect("endpoint");
    let dialog_layer = DialogLayer::new(endpoint.inner.clone());
    assert_eq!(dialog_layer.increment_last_seq(), 1);
    assert_eq!(dialog_layer.increment_last_seq(), 2);
}

#[test]
fn test_dialog_id_display() {
    let id = DialogId {
        call_id: "abc@example.com".to_string(),
        from_tag: "f1".to_string(),
        to_tag: "t1".to_string(),
    };
    assert_eq!(id.to_string(), "abc@example.com-f1-t1");
}
