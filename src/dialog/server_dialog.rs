use super::dialog::{Dialog, DialogInnerRef, DialogState, TerminatedReason};
use super::DialogId;
use crate::rsip_ext::extract_uri_from_contact;
use crate::transaction::transaction::{Transaction, TransactionEvent};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Request, SipMessage, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, trace};

/// Server-side INVITE dialog (UAS). The owner answers the surfaced
/// INVITE with [`accept`](ServerInviteDialog::accept) or
/// [`reject`](ServerInviteDialog::reject) while
/// [`handle`](ServerInviteDialog::handle) drives the transaction.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.dialog_id()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    pub fn initial_request(&self) -> Request {
        self.inner
            .initial_request
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Answer the INVITE with 200. The dialog waits for the ACK
    /// before it is confirmed.
    pub fn accept(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        let sender = self
            .inner
            .tu_sender
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?
            .clone();
        match sender {
            Some(sender) => {
                let resp = self.inner.make_response(
                    &self.initial_request(),
                    StatusCode::OK,
                    headers,
                    body,
                );
                self.inner
                    .transition(DialogState::WaitAck(self.id(), resp.clone()))?;
                sender
                    .send(TransactionEvent::Respond(resp))
                    .map_err(Into::into)
            }
            None => Err(Error::DialogError(
                "transaction is already terminated".to_string(),
                self.id(),
            )),
        }
    }

    pub fn reject(&self, status: Option<StatusCode>) -> Result<()> {
        let sender = self
            .inner
            .tu_sender
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?
            .clone();
        match sender {
            Some(sender) => {
                let status = status.unwrap_or(StatusCode::Decline);
                let resp =
                    self.inner
                        .make_response(&self.initial_request(), status.clone(), None, None);
                self.inner.transition(DialogState::Terminated(
                    self.id(),
                    TerminatedReason::UasOther(status),
                ))?;
                sender
                    .send(TransactionEvent::Respond(resp))
                    .map_err(Into::into)
            }
            None => Err(Error::DialogError(
                "transaction is already terminated".to_string(),
                self.id(),
            )),
        }
    }

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
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))?;
        Ok(())
    }

    /// Offer new session parameters to the peer. Subject to the same
    /// glare handling as the client side.
    pub async fn reinvite(
        &self,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        let request = self
            .inner
            .make_request(rsip::Method::Invite, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    pub async fn info(
        &self,
        headers: Option<Vec<Header>>,
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

    pub async fn update(
        &self,
        headers: Option<Vec<Header>>,
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

    /// Dispatch a transaction matched to this dialog: the initial
    /// INVITE, a CANCEL for it, or any in-dialog request.
    pub async fn handle(&mut self, mut tx: Transaction) -> Result<()> {
        let span = info_span!("server_invite_dialog", dialog_id = %self.id());
        let _enter = span.enter();
        trace!(method = %tx.original.method, "handle request");

        if tx.original.method == rsip::Method::Cancel {
            return self.handle_cancel(tx).await;
        }
        if tx.original.method == rsip::Method::Invite && !self.inner.is_confirmed() {
            return self.handle_invite(tx).await;
        }
        if tx.original.method == rsip::Method::Ack && !self.inner.is_confirmed() {
            // the 2xx ACK travels on its own branch, outside the
            // INVITE transaction
            info!(id = %self.id(), "received ack");
            self.inner.transition(DialogState::Confirmed(self.id()))?;
            return Ok(());
        }

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
                    tx.reply(StatusCode::MethodNotAllowed).await?;
                    Ok(())
                }
            }
        } else {
            info!(id = %self.id(), method = %tx.original.method,
                "request before dialog confirmed");
            Ok(())
        }
    }

    /// CANCEL arrives as its own transaction: answer it 200, then let
    /// the pending INVITE finish with 487.
    async fn handle_cancel(&mut self, mut tx: Transaction) -> Result<()> {
        if self.inner.is_confirmed() {
            // too late, the INVITE already answered
            tx.reply(StatusCode::OK).await?;
            return Ok(());
        }
        info!(id = %self.id(), "received cancel");
        tx.reply(StatusCode::OK).await?;
        let sender = self
            .inner
            .tu_sender
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?
            .clone();
        if let Some(sender) = sender {
            let resp = self.inner.make_response(
                &self.initial_request(),
                StatusCode::RequestTerminated,
                None,
                None,
            );
            sender.send(TransactionEvent::Respond(resp)).ok();
        }
        self.inner.transition(DialogState::Terminated(
            self.id(),
            TerminatedReason::UacCancel,
        ))?;
        Ok(())
    }

    async fn handle_invite(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .tu_sender
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?
            .replace(tx.tu_sender.clone());

        if !self.inner.is_confirmed() {
            self.inner.transition(DialogState::Calling(self.id()))?;
        }

        while let Some(msg) = tx.receive().await {
            if let SipMessage::Request(req) = msg {
                if req.method == rsip::Method::Ack {
                    info!(id = %self.id(), "received ack");
                    self.inner
                        .transition(DialogState::Confirmed(self.id()))?;
                }
            }
        }
        trace!(id = %self.id(), "invite transaction done");
        self.inner
            .tu_sender
            .lock()
            .map_err(|e| Error::Error(e.to_string()))?
            .take();
        Ok(())
    }

    async fn handle_reinvite(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .uas_pending_reply
            .store(true, std::sync::atomic::Ordering::SeqCst);
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
            .make_response(&tx.original, StatusCode::OK, None, None);
        let result = tx.respond(resp).await;
        self.inner
            .uas_pending_reply
            .store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    async fn handle_bye(&mut self, mut tx: Transaction) -> Result<()> {
        info!(id = %self.id(), "received bye");
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))?;
        tx.reply(StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_info(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .transition(DialogState::Info(self.id(), tx.original.clone()))?;
        tx.reply(StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_options(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .transition(DialogState::Options(self.id(), tx.original.clone()))?;
        tx.reply(StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_update(&mut self, mut tx: Transaction) -> Result<()> {
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone()))?;
        tx.reply(StatusCode::OK).await?;
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
        tx.reply(StatusCode::OK).await?;
        Ok(())
    }
}

impl TryFrom<&Dialog> for ServerInviteDialog {
    type Error = crate::Error;

    fn try_from(dlg: &Dialog) -> Result<Self> {
        match dlg {
            Dialog::ServerInvite(dlg) => Ok(dlg.clone()),
            _ => Err(Error::DialogError(
                "dialog is not a ServerInviteDialog".to_string(),
                dlg.id(),
            )),
        }
    }
}
