use super::{
    authenticate::Credential, client_dialog::ClientInviteDialog,
    server_dialog::ServerInviteDialog, DialogId,
};
use crate::{
    rsip_ext::extract_uri_from_contact,
    transaction::{
        endpoint::EndpointInnerRef,
        key::TransactionRole,
        make_via_branch,
        sender::{RequestApplicant, RequestSender},
        transaction::{Transaction, TransactionEventSender},
    },
    Error, Result,
};
use async_trait::async_trait;
use rand::Rng;
use rsip::{
    headers::Route,
    message::HasHeaders,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact, Via},
    Header, Method, Param, Request, Response, StatusCode,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Observable dialog lifecycle. Pushed through the dialog's state
/// channel on every transition; requests the dialog cannot decide on
/// its own (re-INVITE, INFO, OPTIONS, NOTIFY) are surfaced so the
/// owner can respond.
#[derive(Clone)]
pub enum DialogState {
    Calling(DialogId),
    Trying(DialogId),
    Early(DialogId, Response),
    WaitAck(DialogId, Response),
    Confirmed(DialogId),
    Updated(DialogId, Request),
    Notify(DialogId, Request),
    Info(DialogId, Request),
    Options(DialogId, Request),
    Terminated(DialogId, TerminatedReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatedReason {
    Timeout,
    UacCancel,
    UacBye,
    UasBye,
    UacBusy,
    UasBusy,
    UasDecline,
    ProxyAuthRequired,
    UacOther(StatusCode),
    UasOther(StatusCode),
}

pub type DialogStateReceiver = UnboundedReceiver<DialogState>;
pub type DialogStateSender = UnboundedSender<DialogState>;

impl DialogState {
    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Trying(id)
            | DialogState::Early(id, _)
            | DialogState::WaitAck(id, _)
            | DialogState::Confirmed(id)
            | DialogState::Updated(id, _)
            | DialogState::Notify(id, _)
            | DialogState::Info(id, _)
            | DialogState::Options(id, _)
            | DialogState::Terminated(id, _) => id,
        }
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            DialogState::Calling(_) | DialogState::Trying(_) | DialogState::Early(_, _)
        )
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Calling(id) => write!(f, "{}(Calling)", id),
            DialogState::Trying(id) => write!(f, "{}(Trying)", id),
            DialogState::Early(id, _) => write!(f, "{}(Early)", id),
            DialogState::WaitAck(id, _) => write!(f, "{}(WaitAck)", id),
            DialogState::Confirmed(id) => write!(f, "{}(Confirmed)", id),
            DialogState::Updated(id, _) => write!(f, "{}(Updated)", id),
            DialogState::Notify(id, _) => write!(f, "{}(Notify)", id),
            DialogState::Info(id, _) => write!(f, "{}(Info)", id),
            DialogState::Options(id, _) => write!(f, "{}(Options)", id),
            DialogState::Terminated(id, reason) => write!(f, "{}(Terminated {:?})", id, reason),
        }
    }
}

pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,

    pub local_seq: Arc<AtomicU32>,
    pub local_contact: Option<rsip::Uri>,
    pub remote_contact: Mutex<Option<rsip::Uri>>,

    pub remote_seq: AtomicU32,
    pub remote_uri: Mutex<rsip::Uri>,

    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,

    pub credential: Option<Credential>,
    pub route_set: Mutex<Vec<Route>>,

    /// A locally originated re-INVITE is awaiting its final response.
    pub(super) uac_pending_reply: AtomicBool,
    /// A remote re-INVITE was surfaced to the owner and still owes a
    /// final response.
    pub(super) uas_pending_reply: AtomicBool,

    pub(super) endpoint_inner: EndpointInnerRef,
    pub(super) state_sender: DialogStateSender,
    /// Event channel of the INVITE server transaction while it is
    /// live, so accept/reject can push a response into it.
    pub(super) tu_sender: Mutex<Option<TransactionEventSender>>,
    /// Updated when the initial INVITE is re-issued with credentials.
    pub(super) initial_request: Mutex<Request>,
}

pub(super) type DialogInnerRef = Arc<DialogInner>;

/// How long a dialog waits before re-issuing a request that hit 491
/// glare.
pub(super) const GLARE_RETRY_AFTER: std::time::Duration = std::time::Duration::from_secs(1);

/// In-dialog requests only need the final response; provisionals are
/// traced and dropped.
struct InDialogObserver;

#[async_trait]
impl RequestApplicant for InDialogObserver {
    async fn receive_response(&self, resp: &Response) {
        trace!(status = %resp.status_code, "in-dialog response");
    }
}

impl DialogInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<Self> {
        let cseq = initial_request.cseq_header()?.seq()?;

        let remote_uri = match role {
            TransactionRole::Client => initial_request.uri.clone(),
            TransactionRole::Server => {
                extract_uri_from_contact(initial_request.contact_header()?.value())?
            }
        };

        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) && !id.to_tag.is_empty() {
            to.params.push(Param::Tag(id.to_tag.clone().into()));
        }

        let mut route_set = vec![];
        for h in initial_request.headers.iter() {
            if let Header::RecordRoute(rr) = h {
                route_set.push(Route::from(rr.value()));
            }
        }
        route_set.reverse();

        Ok(Self {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id.clone()),
            from,
            to: Mutex::new(to),
            local_seq: Arc::new(AtomicU32::new(cseq)),
            remote_uri: Mutex::new(remote_uri),
            remote_seq: AtomicU32::new(0),
            credential,
            route_set: Mutex::new(route_set),
            uac_pending_reply: AtomicBool::new(false),
            uas_pending_reply: AtomicBool::new(false),
            endpoint_inner,
            state_sender,
            tu_sender: Mutex::new(None),
            state: Mutex::new(DialogState::Calling(id)),
            initial_request: Mutex::new(initial_request),
            local_contact,
            remote_contact: Mutex::new(None),
        })
    }

    pub fn can_cancel(&self) -> bool {
        self.state.lock().map(|s| s.can_cancel()).unwrap_or(false)
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().map(|s| s.is_confirmed()).unwrap_or(false)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().map(|s| s.is_terminated()).unwrap_or(true)
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(super) fn dialog_id(&self) -> DialogId {
        self.id
            .lock()
            .map(|id| id.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn update_remote_tag(&self, tag: &str) -> Result<()> {
        self.id
            .lock()
            .map(|mut id| id.to_tag = tag.to_string())
            .map_err(|e| Error::Error(e.to_string()))?;
        if self.role == TransactionRole::Client {
            self.to
                .lock()
                .map(|mut to| *to = to.clone().with_tag(tag.into()))
                .map_err(|e| Error::Error(e.to_string()))?;
        }
        Ok(())
    }

    /// New remote target from a Contact in a 2xx or a target-refresh
    /// request; later in-dialog requests go there.
    pub fn set_remote_target(&self, uri: rsip::Uri) {
        self.remote_uri
            .lock()
            .map(|mut r| *r = uri.clone())
            .ok();
        self.remote_contact.lock().map(|mut c| c.replace(uri)).ok();
    }

    /// Client dialogs learn their route set from the Record-Route of
    /// the response that establishes the dialog, reversed.
    pub(crate) fn update_route_set_from_response(&self, resp: &Response) {
        if self.role != TransactionRole::Client {
            return;
        }
        let mut new_route_set: Vec<Route> = resp
            .headers()
            .iter()
            .filter_map(|header| match header {
                Header::RecordRoute(rr) => Some(Route::from(rr.value())),
                _ => None,
            })
            .collect();
        new_route_set.reverse();
        self.route_set.lock().map(|mut rs| *rs = new_route_set).ok();
    }

    /// Reject or admit an incoming in-dialog request before it reaches
    /// the owner. Returns the rejection to send, if any, and advances
    /// `remote_seq` on admission.
    pub(super) fn check_in_dialog_request(
        &self,
        req: &Request,
    ) -> Result<Option<(StatusCode, Vec<Header>)>> {
        let cseq = req.cseq_header()?.seq()?;
        let remote_seq = self.remote_seq.load(Ordering::SeqCst);

        if remote_seq != 0 && cseq <= remote_seq {
            // out of order, RFC 3261 section 12.2.2
            if req.method == Method::Ack || req.method == Method::Cancel {
                return Ok(None);
            }
            debug!(id = %self.dialog_id(), cseq, remote_seq, "rejecting out-of-order request");
            return Ok(Some((StatusCode::ServerInternalError, vec![])));
        }

        if req.method == Method::Invite {
            if self.uac_pending_reply.load(Ordering::SeqCst) {
                // glare: our own re-INVITE is still in flight,
                // RFC 3261 section 14.2. remote_seq stays put so the
                // peer may retry this CSeq once the glare clears.
                debug!(id = %self.dialog_id(), "rejecting re-INVITE with 491, UAC pending");
                return Ok(Some((StatusCode::RequestPending, vec![])));
            }
            if self.uas_pending_reply.load(Ordering::SeqCst) {
                // a previous re-INVITE still owes its final response
                let retry_after = rand::thread_rng().gen_range(1..=10);
                debug!(id = %self.dialog_id(), retry_after,
                    "rejecting re-INVITE with 500, UAS pending");
                self.remote_seq.store(cseq, Ordering::SeqCst);
                return Ok(Some((
                    StatusCode::ServerInternalError,
                    vec![Header::Other("Retry-After".into(), retry_after.to_string())],
                )));
            }
        }

        self.remote_seq.store(cseq, Ordering::SeqCst);
        Ok(None)
    }

    pub(super) fn build_vias_from_initial_request(&self) -> Result<Vec<Via>> {
        let mut vias = vec![];
        let initial_request = self
            .initial_request
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?;
        for header in initial_request.headers.iter() {
            if let Header::Via(via) = header {
                if let Ok(mut typed_via) = via.typed() {
                    for param in typed_via.params.iter_mut() {
                        if let Param::Branch(_) = param {
                            *param = make_via_branch();
                        }
                    }
                    vias.push(typed_via);
                    return Ok(vias);
                }
            }
        }
        let via = self.endpoint_inner.get_via(None, None)?;
        vias.push(via);
        Ok(vias)
    }

    pub(super) fn make_request(
        &self,
        method: Method,
        cseq: Option<u32>,
        branch: Option<Param>,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let via = self.endpoint_inner.get_via(None, branch)?;
        self.make_request_with_vias(method, cseq, vec![via], headers, body)
    }

    pub(super) fn make_request_with_vias(
        &self,
        method: Method,
        cseq: Option<u32>,
        vias: Vec<Via>,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let mut headers = headers.unwrap_or_default();
        let cseq_header = CSeq {
            seq: cseq.unwrap_or_else(|| self.increment_local_seq()),
            method,
        };

        for via in vias {
            headers.push(Header::Via(via.into()));
        }
        let id = self.dialog_id();
        headers.push(Header::CallId(id.call_id.clone().into()));

        match self.role {
            TransactionRole::Client => {
                headers.push(Header::From(self.from.clone().into()));
                let to = self
                    .to
                    .lock()
                    .map(|to| to.clone())
                    .map_err(|e| Error::Error(e.to_string()))?;
                headers.push(Header::To(to.into()));
            }
            TransactionRole::Server => {
                // we answer as the remote's To, so our requests invert
                // the original From/To
                let to = self
                    .to
                    .lock()
                    .map(|to| to.clone())
                    .map_err(|e| Error::Error(e.to_string()))?;
                headers.push(Header::From(rsip::typed::From {
                    display_name: to.display_name.clone(),
                    uri: to.uri.clone(),
                    params: to.params.clone(),
                }.into()));
                headers.push(Header::To(rsip::typed::To {
                    display_name: self.from.display_name.clone(),
                    uri: self.from.uri.clone(),
                    params: self.from.params.clone(),
                }.into()));
            }
        }

        headers.push(Header::CSeq(cseq_header.into()));
        headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        if let Some(contact) = self.local_contact.as_ref() {
            headers.push(Contact::from(contact.clone()).into());
        }

        {
            let route_set = self
                .route_set
                .lock()
                .map_err(|e| Error::Error(e.to_string()))?;
            headers.extend(route_set.iter().cloned().map(Header::Route));
        }
        headers.push(Header::MaxForwards(70.into()));
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        let remote_uri = self
            .remote_uri
            .lock()
            .map(|u| u.clone())
            .map_err(|e| Error::Error(e.to_string()))?;
        Ok(Request {
            method,
            uri: remote_uri,
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    pub(super) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp = self.endpoint_inner.make_response(request, status, body);
        if let Some(headers) = headers {
            for header in headers {
                resp.headers.unique_push(header);
            }
        }
        // stamp our tag on the To header
        let id = self.dialog_id();
        let local_tag = match self.role {
            TransactionRole::Server => id.to_tag.clone(),
            TransactionRole::Client => id.from_tag.clone(),
        };
        if !local_tag.is_empty() {
            if let Ok(to) = resp.to_header().and_then(|t| t.typed()) {
                if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                    resp.headers
                        .unique_push(Header::To(to.with_tag(local_tag.into()).into()));
                }
            }
        }
        if let Some(contact) = self.local_contact.as_ref() {
            resp.headers
                .unique_push(Contact::from(contact.clone()).into());
        }
        resp
    }

    /// Send an in-dialog request and wait for its final response. The
    /// underlying sender answers one digest challenge; 491 glare is
    /// retried once after [`GLARE_RETRY_AFTER`], and a 408 or 481
    /// terminates the dialog (RFC 3261 section 12.2.1.2, the peer no
    /// longer knows it).
    pub(super) async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let is_invite = request.method == Method::Invite;
        if is_invite && self.uac_pending_reply.swap(true, Ordering::SeqCst) {
            // RFC 3261 section 14.1: one outstanding re-INVITE at a
            // time, reject locally instead of putting it on the wire
            return Err(Error::DialogError(
                "re-INVITE still awaiting a final response".to_string(),
                self.dialog_id(),
            ));
        }
        let result = self.send_dialog_request(request.clone()).await;
        if is_invite {
            self.uac_pending_reply.store(false, Ordering::SeqCst);
        }

        let result = match result {
            Ok(Some(resp)) if resp.status_code == StatusCode::RequestPending => {
                // glare, RFC 3261 section 14.1: back off and try once
                // more with a fresh CSeq and branch
                if self.is_terminated() {
                    return Ok(Some(resp));
                }
                info!(id = %self.dialog_id(), "491 glare, retrying after {:?}", GLARE_RETRY_AFTER);
                tokio::time::sleep(GLARE_RETRY_AFTER).await;
                if self.is_terminated() {
                    return Ok(Some(resp));
                }
                let mut retry = request;
                retry.cseq_header_mut()?.mut_seq(self.increment_local_seq())?;
                let mut via = retry.via_header()?.typed()?;
                via.params.retain(|p| !matches!(p, Param::Branch(_)));
                via.params.push(make_via_branch());
                retry.headers_mut().unique_push(via.into());

                if is_invite && self.uac_pending_reply.swap(true, Ordering::SeqCst) {
                    // someone else took the slot during the backoff
                    return Ok(Some(resp));
                }
                let result = self.send_dialog_request(retry).await;
                if is_invite {
                    self.uac_pending_reply.store(false, Ordering::SeqCst);
                }
                result
            }
            other => other,
        };

        if let Ok(Some(resp)) = result.as_ref() {
            match resp.status_code {
                StatusCode::RequestTimeout => {
                    info!(id = %self.dialog_id(), "in-dialog request timed out, dialog gone");
                    self.transition(DialogState::Terminated(
                        self.dialog_id(),
                        TerminatedReason::Timeout,
                    ))?;
                }
                StatusCode::CallTransactionDoesNotExist => {
                    info!(id = %self.dialog_id(), "peer no longer knows this dialog");
                    self.transition(DialogState::Terminated(
                        self.dialog_id(),
                        TerminatedReason::UasOther(resp.status_code.clone()),
                    ))?;
                }
                _ => {}
            }
        }
        result
    }

    /// Send without a client transaction. The 2xx ACK is the only
    /// request with no response to wait for.
    pub(super) async fn send_raw_request(&self, request: Request) -> Result<()> {
        let uri = crate::rsip_ext::destination_from_request(&request)
            .map(|addr| rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            })
            .unwrap_or_else(|| request.uri.clone());
        let connection = self.endpoint_inner.transport_layer.lookup(&uri)?;
        connection.send(request.into(), None).await
    }

    /// One in-dialog request through [`RequestSender`], sharing the
    /// dialog's CSeq counter so a digest retry keeps the sequence
    /// monotonic.
    async fn send_dialog_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method().to_owned();
        let mut sender = RequestSender::new(self.endpoint_inner.clone(), self.credential.clone())
            .with_dialog_seq(self.local_seq.clone());
        let resp = sender.send(request, &InDialogObserver).await.map_err(|e| {
            warn!(id = %self.dialog_id(), %method, "failed to send request: {}", e);
            e
        })?;
        if let Some(resp) = resp.as_ref() {
            debug!(id = %self.dialog_id(), %method, status = %resp.status_code,
                "in-dialog request done");
        }
        Ok(resp)
    }

    pub(super) fn transition(&self, state: DialogState) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?;
        if guard.is_terminated() {
            return Ok(());
        }
        debug!(id = %self.dialog_id(), from = %guard, to = %state, "dialog transition");
        self.state_sender.send(state.clone())?;
        *guard = state;
        Ok(())
    }
}

/// Either side of an INVITE dialog, what the dialog layer hands back
/// from lookups.
#[derive(Clone)]
pub enum Dialog {
    ServerInvite(ServerInviteDialog),
    ClientInvite(ClientInviteDialog),
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        match self {
            Dialog::ServerInvite(d) => d.inner.dialog_id(),
            Dialog::ClientInvite(d) => d.inner.dialog_id(),
        }
    }

    pub async fn handle(&mut self, tx: Transaction) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.handle(tx).await,
            Dialog::ClientInvite(d) => d.handle(tx).await,
        }
    }

    pub(super) fn on_remove(&self) {
        match self {
            Dialog::ServerInvite(d) => d.inner.cancel_token.cancel(),
            Dialog::ClientInvite(d) => d.inner.cancel_token.cancel(),
        }
    }
}
