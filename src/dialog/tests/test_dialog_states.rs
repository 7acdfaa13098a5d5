use super::{create_invite_request, create_test_endpoint};
use crate::dialog::dialog::{DialogInner, DialogState, TerminatedReason};
use crate::dialog::DialogId;
use crate::transaction::key::TransactionRole;
use rsip::StatusCode;
use std::collections::HashMap;
use tokio::sync::mpsc::unbounded_channel;

#[test]
fn test_dialog_id_eq() {
    let request = create_invite_request("from-tag-1", Some("to-tag-1"), "call-id-1@example.com");
    let id = DialogId::try_from(&request).expect("dialog id");
    assert_eq!(id.call_id, "call-id-1@example.com");
    assert_eq!(id.from_tag, "from-tag-1");
    assert_eq!(id.to_tag, "to-tag-1");

    // the same dialog seen from the other side compares equal
    let swapped = id.swapped();
    assert_eq!(id, swapped);

    let mut map = HashMap::new();
    map.insert(id.clone(), ());
    assert!(map.contains_key(&swapped));

    let other = DialogId {
        call_id: "call-id-2@example.com".to_string(),
        from_tag: id.from_tag.clone(),
        to_tag: id.to_tag.clone(),
    };
    assert_ne!(id, other);
}

#[tokio::test]
async fn test_dialog_state_transitions() {
    let endpoint = create_test_endpoint().await.expect("endpoint");
    let request = create_invite_request("from-tag-1", None, "states@example.com");
    let id = DialogId::try_from(&request).expect("dialog id");
    let (state_tx, mut state_rx) = unbounded_channel();

    let inner = DialogInner::new(
        TransactionRole::Client,
        id.clone(),
        request.clone(),
        endpoint.inner.clone(),
        state_tx,
        None,
        None,
    )
    .expect("dialog inner");

    assert!(matches!(
        *inner.state.lock().expect("state"),
        DialogState::Calling(_)
    ));
    assert!(inner.can_cancel());
    assert!(!inner.is_confirmed());

    let ringing = endpoint
        .inner
        .make_response(&request, StatusCode::Ringing, None);
    inner
        .transition(DialogState::Early(id.clone(), ringing))
        .expect("early");
    assert!(inner.can_cancel());

    inner
        .transition(DialogState::Confirmed(id.clone()))
        .expect("confirmed");
    assert!(inner.is_confirmed());
    assert!(!inner.can_cancel());

    inner
        .transition(DialogState::Terminated(
            id.clone(),
            TerminatedReason::UacBye,
        ))
        .expect("terminated");
    assert!(inner.is_terminated());

    // a terminated dialog ignores further transitions
    inner
        .transition(DialogState::Confirmed(id.clone()))
        .expect("transition after terminated");
    assert!(inner.is_terminated());

    let mut seen = vec![];
    while let Ok(state) = state_rx.try_recv() {
        seen.push(state);
    }
    assert_eq!(seen.len(), 3);
    assert!(matches!(seen[0], DialogState::Early(_, _)));
    assert!(matches!(seen[1], DialogState::Confirmed(_)));
    assert!(matches!(
        seen[2],
        DialogState::Terminated(_, TerminatedReason::UacBye)
    ));
}

#[tokio::test]
async fn test_dialog_seq_and_remote_tag() {
    let endpoint = create_test_endpoint().await.expect("endpoint");
    let request = create_invite_request("from-tag-1", None, "seq@example.com");
    let id = DialogId::try_from(&request).expect("dialog id");
    let (state_tx, _state_rx) = unbounded_channel();

    let inner = DialogInner::new(
        TransactionRole::Client,
        id,
        request,
        endpoint.inner.clone(),
        state_tx,
        None,
        None,
    )
    .expect("dialog inner");

    assert_eq!(inner.get_local_seq(), 1);
    assert_eq!(inner.increment_local_seq(), 2);
    assert_eq!(inner.get_local_seq(), 2);

    inner.update_remote_tag("to-tag-learned").expect("tag");
    assert_eq!(inner.dialog_id().to_tag, "to-tag-learned");
    let to = inner.to.lock().expect("to").to_string();
    assert!(to.contains("tag=to-tag-learned"));
}
