use super::dialog::DialogInnerRef;
use super::DialogId;
use crate::dialog::{
    authenticate::handle_client_authenticate,
    dialog::{DialogState, TerminatedReason},
};
use crate::rsip_ext::extract_uri_from_contact;
use crate::transaction::transaction::{Transaction, TransactionEvent};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Response, SipMessage, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

/// Client-side INVITE dialog (UAC).
///
/// Created around an outgoing INVITE; [`process_invite`] drives the
/// INVITE transaction to its final response, after which the dialog is
/// confirmed (2xx plus ACK) or terminated. In-dialog requests go out
/// through [`bye`], [`reinvite`], [`update`], [`info`] and
/// [`options`]; requests arriving from the peer land in [`handle`].
///
/// Cloneable and thread-safe, all state lives behind the shared inner.
///
/// [`process_invite`]: ClientInviteDialog::process_invite
/// [`bye`]: ClientInviteDialog::bye
/// [`reinvite`]: ClientInviteDialog::reinvite
/// [`update`]: ClientInviteDialog::update
/// [`info`]: ClientInviteDialog::info
/// [`options`]: ClientInviteDialog::options
/// [`handle`]: ClientInviteDialog::handle
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.dialog_id()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// CANCEL before the call is answered, BYE after.
    pub async fn hangup(&self) -> Result<()> {
        if self.inner.can_cancel() {
            self.cancel().await
        } else {
            self.bye().await
        }
    }

    /// Terminate an established dialog. A no-op when the dialog never
    /// confirmed.
    pub async fn bye(&self) -> Result<()> {
        if !self.inner.is_confirmed() {
            return Ok(());
        }
        let request = self
            .inner
            .make_request(rsip::Method::Bye, None, None, None, None)?;
        match self.inner.do_request(request).await {
            Ok(_) => {}
            Err(e) => {
                info!(id = %self.id(), "bye error: {}", e);
            }
        }
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))?;
        Ok(())
    }

    /// Abort call setup before a final response arrives. The CANCEL is
    /// built by the INVITE transaction itself (same branch and CSeq
    /// number, RFC 3261 section 9.1) and only goes on the wire once a
    /// provisional has been received.
    pub async fn cancel(&self) -> Result<()> {
        if self.inner.is_confirmed() {
            return Ok(());
        }
        info!(id = %self.id(), "sending cancel request");
        let sender = self
            .inner
            .tu_sender
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?
            .clone();
        match sender {
            Some(sender) => {
                sender.send(TransactionEvent::Cancel).map_err(Into::into)
            }
            None => Err(Error::DialogError(
                "no INVITE transaction to cancel".to_string(),
                self.id(),
            )),
        }
    }

    /// Modify the session with a re-INVITE. Glare with a competing
    /// remote re-INVITE is retried once by the dialog itself.
    pub async fn reinvite(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        let request = self
            .inner
            .make_request(rsip::Method::Invite, None, None, headers, body)?;
        let resp = self.inner.do_request(request.clone()).await;
        if let Ok(Some(ref resp)) = resp {
            if resp.status_code == StatusCode::OK {
                self.send_ack_for(resp).await?;
                self.inner
                    .transition(DialogState::Updated(self.id(), request))?;
            }
        }
        resp
    }

    pub async fn update(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        let request = self
            .inner
            .make_request(rsip::Method::Update, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    pub async fn info(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        let request = self
            .inner
            .make_request(rsip::Method::Info, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    pub async fn options(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        let request = self
            .inner
            .make_request(rsip::Method::Options, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    /// Requests the peer sends inside this dialog. BYE terminates,
    /// INFO/OPTIONS/UPDATE are surfaced and answered 200, a re-INVITE
    /// goes through the glare gate first.
    pub async fn handle(&mut self, mut tx: Transaction) -> Result<()> {
        trace!(id = %self.id(), method = %tx.original.method, "handle in-dialog request");

        if let Some((status, headers)) = self.inner.check_in_dialog_request(&tx.original)? {
            tx.reply_with(status, Some(headers), None).await?;
            return Ok(());
        }

        if self.inner.is_confirmed() {
            match tx.original.method {
                rsip::Method::Invite => self.handle_reinvite(tx).await,
                rsip::Method::Bye => self.handle_bye(tx).await,
                rsip::Method::Info => self.handle_info(tx).await,
                rsip::Method::Options => self.handle_options(tx).await,
                rsip::Method::Update => self.handle_update(tx).await,
                rsip::Method::Notify => self.handle_notify(tx).await,
                rsip::Method::Ack => Ok(()),
                _ => {
                    info!(id = %self.id(), "unsupported in-dialog method: {}", tx.original.method);
                    tx.reply(rsip::StatusCode::MethodNotAllowed).await?;
                    Ok(())
                }
            }
        } else {
            info!(id = %self.id(), method = %tx.original.method,
                "request before dialog confirmed");
            Ok(())
        }
    }

    async fn handle_reinvite(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner.uas_pending_reply.store(true, std::sync::atomic::Ordering::SeqCst);
        // a re-INVITE is a target refresh request, RFC 3261 section 12.2.2
        if let Ok(contact) = tx.original.contact_header() {
            if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                self.inner.set_remote_target(uri);
            }
        }
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone()))?;
        let resp = self
            .inner
            .make_response(&tx.original, rsip::StatusCode::OK, None, None);
        let result = tx.respond(resp).await;
        self.inner.uas_pending_reply.store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    async fn handle_bye(&mut self, mut tx: Transaction) -> Result<()> {
        info!(id = %self.id(), "received bye");
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))?;
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_info(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .transition(DialogState::Info(self.id(), tx.original.clone()))?;
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_options(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .transition(DialogState::Options(self.id(), tx.original.clone()))?;
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_update(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone()))?;
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    /// NOTIFY with a Contact refreshes the remote target, RFC 6665
    /// style target refresh.
    async fn handle_notify(&mut self, mut tx: Transaction) -> Result<()> {
        if let Ok(contact) = tx.original.contact_header() {
            if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                self.inner.set_remote_target(uri);
            }
        }
        self.inner
            .transition(DialogState::Notify(self.id(), tx.original.clone()))?;
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    /// Drive the initial INVITE transaction. Returns the final dialog
    /// id (with the remote tag learned from the final response) and
    /// the final response itself.
    pub async fn process_invite(
        &self,
        mut tx: Transaction,
    ) -> Result<(DialogId, Option<Response>)> {
        self.inner
            .tu_sender
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?
            .replace(tx.tu_sender.clone());
        self.inner.transition(DialogState::Calling(self.id()))?;
        let mut auth_sent = false;
        tx.send().await?;
        let mut dialog_id = self.id();
        let mut final_response = None;
        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                SipMessage::Request(_) => continue,
            };
            match resp.status_code {
                StatusCode::Trying => {
                    self.inner.transition(DialogState::Trying(self.id()))?;
                    continue;
                }
                StatusCode::Ringing | StatusCode::SessionProgress => {
                    if let Ok(Some(tag)) = resp.to_header()?.tag() {
                        self.inner.update_remote_tag(tag.value())?;
                    }
                    self.inner
                        .transition(DialogState::Early(self.id(), resp))?;
                    continue;
                }
                StatusCode::ProxyAuthenticationRequired | StatusCode::Unauthorized => {
                    if auth_sent {
                        info!(id = %self.id(), status = %resp.status_code,
                            "challenge after auth sent, giving up");
                        final_response = Some(resp);
                        self.inner.transition(DialogState::Terminated(
                            self.id(),
                            TerminatedReason::ProxyAuthRequired,
                        ))?;
                        break;
                    }
                    auth_sent = true;
                    if let Some(credential) = &self.inner.credential {
                        tx = handle_client_authenticate(
                            self.inner.increment_local_seq(),
                            tx,
                            resp,
                            credential,
                        )
                        .await?;
                        // the retried INVITE starts the dialog over
                        self.inner.update_remote_tag("").ok();
                        self.inner
                            .initial_request
                            .lock()
                            .map(|mut r| *r = tx.original.clone())
                            .ok();
                        self.inner
                            .tu_sender
                            .lock()
                            .map(|mut s| s.replace(tx.tu_sender.clone()))
                            .ok();
                        tx.send().await?;
                        continue;
                    }
                    info!(id = %self.id(), "challenge without credential");
                    final_response = Some(resp);
                    self.inner.transition(DialogState::Terminated(
                        self.id(),
                        TerminatedReason::ProxyAuthRequired,
                    ))?;
                    break;
                }
                _ => {}
            }
            if let Ok(Some(tag)) = resp.to_header()?.tag() {
                self.inner.update_remote_tag(tag.value())?;
            }
            if let Ok(id) = DialogId::try_from(&resp) {
                dialog_id = id;
            }
            match resp.status_code.kind() {
                rsip::StatusCodeKind::Successful => {
                    // 2xx to INVITE always carries a Contact
                    if let Ok(contact) = resp.contact_header() {
                        if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                            self.inner.set_remote_target(uri);
                        }
                    }
                    self.inner.update_route_set_from_response(&resp);
                    self.send_ack_for(&resp).await?;
                    self.inner
                        .transition(DialogState::Confirmed(dialog_id.clone()))?;
                }
                _ => {
                    let reason = match resp.status_code {
                        StatusCode::BusyHere => TerminatedReason::UasBusy,
                        StatusCode::Decline => TerminatedReason::UasDecline,
                        StatusCode::RequestTimeout => TerminatedReason::Timeout,
                        // 487 means our CANCEL won
                        StatusCode::RequestTerminated => TerminatedReason::UacCancel,
                        ref other => TerminatedReason::UasOther(other.clone()),
                    };
                    self.inner
                        .transition(DialogState::Terminated(dialog_id.clone(), reason))?;
                }
            }
            final_response = Some(resp);
            break;
        }
        self.inner
            .tu_sender
            .lock()
            .map(|mut s| s.take())
            .ok();
        // Keep the machine alive for its absorption window (Timers D
        // and M): it re-ACKs retransmitted non-2xx finals itself, and
        // retransmitted 2xx are surfaced here so the cached ACK path
        // fires again.
        let dialog = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = tx.receive().await {
                if let SipMessage::Response(resp) = msg {
                    if resp.status_code.kind() == rsip::StatusCodeKind::Successful {
                        trace!(id = %dialog.id(), "re-acking retransmitted 2xx");
                        dialog.send_ack_for(&resp).await.ok();
                    }
                }
            }
        });
        Ok((dialog_id, final_response))
    }

    /// ACK for a 2xx travels end to end outside the INVITE
    /// transaction, with its own CSeq matching the INVITE's.
    async fn send_ack_for(&self, resp: &Response) -> Result<()> {
        let invite_cseq = resp.cseq_header()?.seq()?;
        let ack = self.inner.make_request(
            rsip::Method::Ack,
            Some(invite_cseq),
            None,
            None,
            None,
        )?;
        self.inner.send_raw_request(ack).await
    }
}
