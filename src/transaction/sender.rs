use super::{
    endpoint::EndpointInnerRef,
    key::{TransactionKey, TransactionRole},
    transaction::Transaction,
};
use crate::dialog::authenticate::{handle_client_authenticate, is_stale_challenge, Credential};
use crate::Result;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Response, SipMessage, StatusCode, StatusCodeKind};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

/// Callbacks a request owner gets while [`RequestSender`] drives the
/// transaction. Provisionals other than 100 arrive through
/// `receive_response`; the final response is also the return value of
/// [`RequestSender::send`].
#[async_trait]
pub trait RequestApplicant: Send + Sync {
    async fn receive_response(&self, resp: &Response);

    /// The request timed out, either a real 408 from a proxy or the
    /// local one a client transaction synthesizes when Timer B or F
    /// fires.
    async fn on_request_timeout(&self) {}

    async fn on_transport_error(&self) {}
}

/// Sends one logical request, transparently answering at most one
/// digest challenge plus one more retry when the challenge is
/// `stale=true`. Never loops: a second 401/407 (or a second stale one)
/// is returned to the caller as the final response.
pub struct RequestSender {
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    /// When sending inside a dialog, the dialog's local CSeq counter,
    /// so auth retries keep the dialog sequence monotonic.
    pub dialog_seq: Option<Arc<AtomicU32>>,
    challenged: bool,
    staled: bool,
}

impl RequestSender {
    pub fn new(endpoint: EndpointInnerRef, credential: Option<Credential>) -> Self {
        RequestSender {
            endpoint,
            credential,
            dialog_seq: None,
            challenged: false,
            staled: false,
        }
    }

    pub fn with_dialog_seq(mut self, dialog_seq: Arc<AtomicU32>) -> Self {
        self.dialog_seq.replace(dialog_seq);
        self
    }

    fn next_seq(&self, request: &rsip::Request) -> Result<u32> {
        match self.dialog_seq.as_ref() {
            Some(seq) => Ok(seq.fetch_add(1, Ordering::SeqCst) + 1),
            None => Ok(request.cseq_header()?.typed()?.seq + 1),
        }
    }

    /// Send the request and wait for its final response. Returns
    /// `None` when the transaction ends without one (transport gone).
    pub async fn send(
        &mut self,
        request: rsip::Request,
        applicant: &dyn RequestApplicant,
    ) -> Result<Option<Response>> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        self.run(tx, applicant).await
    }

    fn run<'a>(
        &'a mut self,
        mut tx: Transaction,
        applicant: &'a dyn RequestApplicant,
    ) -> BoxFuture<'a, Result<Option<Response>>> {
        async move {
            if let Err(e) = tx.send().await {
                warn!(key = %tx.key, "transport error sending request: {:?}", e);
                applicant.on_transport_error().await;
                return Err(e);
            }

            while let Some(msg) = tx.receive().await {
                let resp = match msg {
                    SipMessage::Response(resp) => resp,
                    SipMessage::Request(_) => continue,
                };
                match resp.status_code.kind() {
                    StatusCodeKind::Provisional => {
                        if resp.status_code != StatusCode::Trying {
                            applicant.receive_response(&resp).await;
                        }
                        continue;
                    }
                    _ => {}
                }
                match resp.status_code {
                    StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                        if let Some(cred) = self.credential.clone() {
                            let stale = is_stale_challenge(&resp);
                            let retry = if !self.challenged {
                                self.challenged = true;
                                self.staled = stale;
                                true
                            } else if stale && !self.staled {
                                // the server rotated its nonce under
                                // us, one more attempt
                                self.staled = true;
                                true
                            } else {
                                false
                            };
                            if retry {
                                debug!(key = %tx.key, status = %resp.status_code, stale,
                                    "answering digest challenge");
                                let new_seq = self.next_seq(&tx.original)?;
                                let new_tx =
                                    handle_client_authenticate(new_seq, tx, resp, &cred).await?;
                                return self.run(new_tx, applicant).await;
                            }
                        }
                        info!(key = %tx.key, "authentication failed, giving up");
                        applicant.receive_response(&resp).await;
                        return Ok(Some(resp));
                    }
                    StatusCode::RequestTimeout => {
                        applicant.on_request_timeout().await;
                        return Ok(Some(resp));
                    }
                    _ => {
                        applicant.receive_response(&resp).await;
                        return Ok(Some(resp));
                    }
                }
            }
            applicant.on_transport_error().await;
            Ok(None)
        }
        .boxed()
    }
}
