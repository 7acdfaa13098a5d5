use super::{
    endpoint::{make_timeout_response, EndpointInnerRef},
    key::TransactionKey,
    TransactionState, TransactionTimer, TransactionType,
};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionReceiver = UnboundedReceiver<Transaction>;
pub type TransactionSender = UnboundedSender<Transaction>;

/// Everything that can wake a transaction: a message matched by the
/// endpoint, one of its timers, a response pushed down by the TU, or
/// an explicit kill.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Respond(Response),
    /// TU asks a client INVITE to CANCEL itself; only acted on while
    /// Proceeding.
    Cancel,
    Terminate,
}

/// A single client or server transaction, RFC 3261 section 17 with the
/// RFC 6026 Accepted states. All mutation happens inside
/// [`receive`](Transaction::receive); the endpoint and the TU only
/// feed events through the channel.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    /// Overrides the Route/request-URI derived next hop.
    pub destination: Option<SipAddr>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    timer_retransmit: Option<u64>,
    timer_timeout: Option<u64>,
    timer_linger: Option<u64>,
    timer_provisional: Option<u64>,
    is_cleaned_up: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        trace!(%key, ?transaction_type, "transaction created");
        Self {
            transaction_type,
            key,
            original,
            state: TransactionState::Idle,
            endpoint_inner,
            connection,
            destination: None,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_retransmit: None,
            timer_timeout: None,
            timer_linger: None,
            timer_provisional: None,
            is_cleaned_up: false,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(tx_type, key, original, endpoint_inner, connection)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite | Method::Ack => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let mut tx = Transaction::new(tx_type, key, original, endpoint_inner, connection);
        tx.state = TransactionState::Trying;
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    fn is_unreliable(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| !c.is_reliable())
            .unwrap_or(true)
    }

    /// Send the original request, client transactions only. Attaches
    /// to the endpoint registry and starts the retransmit and give-up
    /// timers.
    pub async fn send(&mut self) -> Result<()> {
        match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "send is client-only".to_string(),
                    self.key.clone(),
                ));
            }
        }

        if self.connection.is_none() {
            let destination = self
                .destination
                .clone()
                .or_else(|| crate::rsip_ext::destination_from_request(&self.original))
                .map(|addr| rsip::Uri {
                    host_with_port: addr.addr,
                    ..Default::default()
                })
                .unwrap_or_else(|| self.original.uri.clone());
            let connection = self.endpoint_inner.transport_layer.lookup(&destination)?;
            self.connection.replace(connection);
        }
        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection for request".to_string(), self.key.clone())
        })?;

        self.endpoint_inner
            .attach_transaction(&self.key, self.tu_sender.clone());
        connection
            .send(self.original.to_owned().into(), None)
            .await?;

        let initial = match self.transaction_type {
            TransactionType::ClientInvite => TransactionState::Calling,
            _ => TransactionState::Trying,
        };
        self.transition(initial)
    }

    /// Server shortcut for responses without extra headers or body.
    pub async fn reply(&mut self, status: StatusCode) -> Result<()> {
        self.reply_with(status, None, None).await
    }

    pub async fn reply_with(
        &mut self,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut response = self
            .endpoint_inner
            .make_response(&self.original, status, body);
        if let Some(headers) = headers {
            for header in headers {
                response.headers.unique_push(header);
            }
        }
        self.respond(response).await
    }

    /// Send a response on a server transaction and advance the machine.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        match self.transaction_type {
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "respond is server-only".to_string(),
                    self.key.clone(),
                ));
            }
        }
        let new_state = match response.status_code.kind() {
            StatusCodeKind::Provisional => TransactionState::Proceeding,
            StatusCodeKind::Successful => {
                if self.transaction_type == TransactionType::ServerInvite {
                    TransactionState::Accepted
                } else {
                    TransactionState::Completed
                }
            }
            _ => TransactionState::Completed,
        };
        self.send_response(response).await?;
        self.transition(new_state)
    }

    pub async fn send_trying(&mut self) -> Result<()> {
        self.reply(StatusCode::Trying).await
    }

    /// Fire a CANCEL for a pending client INVITE. Per RFC 3261
    /// section 9.1 the CANCEL copies the INVITE's request URI, CSeq
    /// number and topmost Via (same branch), and is only sent once a
    /// provisional has arrived; before that it is dropped.
    pub async fn send_cancel(&mut self) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "send_cancel requires a client INVITE".to_string(),
                self.key.clone(),
            ));
        }
        if self.state != TransactionState::Proceeding {
            trace!(key = %self.key, state = ?self.state, "CANCEL skipped");
            return Ok(());
        }
        let mut cancel = self.original.clone();
        cancel.method = Method::Cancel;
        cancel.body = Default::default();
        let cseq = cancel.cseq_header()?.typed()?;
        cancel.headers.unique_push(
            rsip::typed::CSeq {
                seq: cseq.seq,
                method: Method::Cancel,
            }
            .into(),
        );
        cancel
            .headers
            .unique_push(rsip::Header::ContentLength(0u32.into()));

        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection for CANCEL".to_string(), self.key.clone())
        })?;
        connection.send(cancel.into(), None).await
    }

    /// Pull the next message this transaction owes its TU. Returns
    /// `None` once the transaction terminates.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        if self.state == TransactionState::Terminated {
            return None;
        }
        while let Some(event) = self.tu_receiver.recv().await {
            let deliver = match event {
                TransactionEvent::Received(msg, connection) => {
                    if let Some(connection) = connection {
                        if self.connection.is_none() {
                            self.connection.replace(connection);
                        }
                    }
                    let processed = match msg {
                        SipMessage::Request(req) => self.process_request(req).await,
                        SipMessage::Response(resp) => self.process_response(resp).await,
                    };
                    match processed {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(key = %self.key, "process message error: {:?}", e);
                            None
                        }
                    }
                }
                TransactionEvent::Timer(timer) => match self.process_timer(timer).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(key = %self.key, "process timer error: {:?}", e);
                        None
                    }
                },
                TransactionEvent::Respond(response) => {
                    if let Err(e) = self.respond(response).await {
                        warn!(key = %self.key, "respond error: {:?}", e);
                    }
                    None
                }
                TransactionEvent::Cancel => {
                    if let Err(e) = self.send_cancel().await {
                        warn!(key = %self.key, "send cancel error: {:?}", e);
                    }
                    None
                }
                TransactionEvent::Terminate => {
                    self.transition(TransactionState::Terminated).ok();
                    return None;
                }
            };
            if let Some(msg) = deliver {
                return Some(msg);
            }
            if self.state == TransactionState::Terminated {
                return None;
            }
        }
        None
    }

    /// Server side: retransmitted request, ACK, or CANCEL matched to
    /// this transaction.
    async fn process_request(&mut self, req: Request) -> Result<Option<SipMessage>> {
        match self.transaction_type {
            TransactionType::ServerInvite => match req.method {
                Method::Invite => {
                    // retransmission, answer with the latest response;
                    // after a 2xx the TU owns retransmitting it
                    // (RFC 6026), absorb silently
                    if self.state != TransactionState::Accepted {
                        if let Some(last_response) = self.last_response.clone() {
                            self.send_response(last_response).await?;
                        }
                    }
                    Ok(None)
                }
                Method::Ack => match self.state {
                    TransactionState::Completed => {
                        // ACK for our non-2xx final
                        self.transition(TransactionState::Confirmed)?;
                        Ok(None)
                    }
                    TransactionState::Accepted => {
                        // 2xx ACK reaching the transaction is still
                        // delivered upward, the dialog owns it
                        Ok(Some(req.into()))
                    }
                    TransactionState::Confirmed => Ok(None),
                    _ => {
                        trace!(key = %self.key, state = ?self.state, "ACK in unexpected state");
                        Ok(None)
                    }
                },
                _ => Ok(Some(req.into())),
            },
            TransactionType::ServerNonInvite => {
                // retransmission
                if let Some(last_response) = self.last_response.clone() {
                    self.send_response(last_response).await?;
                }
                Ok(None)
            }
            _ => {
                trace!(key = %self.key, "request on client transaction ignored");
                Ok(None)
            }
        }
    }

    /// Client side: response matched to this transaction by the
    /// endpoint. Returns the response when the TU should see it.
    async fn process_response(&mut self, resp: Response) -> Result<Option<SipMessage>> {
        match self.transaction_type {
            TransactionType::ClientInvite => self.on_invite_response(resp).await,
            TransactionType::ClientNonInvite => self.on_non_invite_response(resp).await,
            _ => {
                trace!(key = %self.key, "response on server transaction ignored");
                Ok(None)
            }
        }
    }

    async fn on_invite_response(&mut self, resp: Response) -> Result<Option<SipMessage>> {
        match self.state {
            TransactionState::Calling | TransactionState::Proceeding => {
                match resp.status_code.kind() {
                    StatusCodeKind::Provisional => {
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Proceeding)?;
                        Ok(Some(resp.into()))
                    }
                    StatusCodeKind::Successful => {
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Accepted)?;
                        Ok(Some(resp.into()))
                    }
                    _ => {
                        self.last_response.replace(resp.clone());
                        self.send_failure_ack(&resp).await?;
                        self.transition(TransactionState::Completed)?;
                        Ok(Some(resp.into()))
                    }
                }
            }
            TransactionState::Accepted => {
                // RFC 6026: retransmitted 2xx goes to the TU so it can
                // re-send the ACK
                if resp.status_code.kind() == StatusCodeKind::Successful {
                    Ok(Some(resp.into()))
                } else {
                    Ok(None)
                }
            }
            TransactionState::Completed => {
                // retransmitted final, re-fire the ACK and absorb
                if let Some(ack) = self.last_ack.clone() {
                    if let Some(connection) = self.connection.as_ref() {
                        connection.send(ack.into(), None).await?;
                    }
                } else {
                    self.send_failure_ack(&resp).await?;
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn on_non_invite_response(&mut self, resp: Response) -> Result<Option<SipMessage>> {
        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                match resp.status_code.kind() {
                    StatusCodeKind::Provisional => {
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Proceeding)?;
                        Ok(Some(resp.into()))
                    }
                    _ => {
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Completed)?;
                        Ok(Some(resp.into()))
                    }
                }
            }
            // Completed: retransmitted final, absorb
            _ => Ok(None),
        }
    }

    /// ACK for a non-2xx final, built from the INVITE per RFC 3261
    /// section 17.1.1.3 with the response's To tag.
    async fn send_failure_ack(&mut self, resp: &Response) -> Result<()> {
        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Via(self.original.via_header()?.clone()));
        headers.push(rsip::Header::From(self.original.from_header()?.clone()));
        headers.push(rsip::Header::To(resp.to_header()?.clone()));
        headers.push(rsip::Header::CallId(self.original.call_id_header()?.clone()));
        let cseq = self.original.cseq_header()?.typed()?;
        headers.push(
            rsip::typed::CSeq {
                seq: cseq.seq,
                method: Method::Ack,
            }
            .into(),
        );
        headers.push(rsip::Header::MaxForwards(70.into()));
        headers.push(rsip::Header::ContentLength(0u32.into()));
        let ack = Request {
            method: Method::Ack,
            uri: self.original.uri.clone(),
            headers,
            version: self.original.version.clone(),
            body: Default::default(),
        };
        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection for ACK".to_string(), self.key.clone())
        })?;
        connection.send(ack.to_owned().into(), None).await?;
        self.last_ack.replace(ack);
        Ok(())
    }

    async fn process_timer(&mut self, timer: TransactionTimer) -> Result<Option<SipMessage>> {
        match timer {
            TransactionTimer::Retransmit(key, interval) => {
                match self.state {
                    TransactionState::Calling | TransactionState::Trying => {
                        // Timers A and E, re-send the request
                        if let Some(connection) = self.connection.as_ref() {
                            trace!(%key, ?interval, "retransmitting request");
                            connection
                                .send(self.original.to_owned().into(), None)
                                .await?;
                        }
                        self.schedule_retransmit_doubled(interval);
                    }
                    TransactionState::Completed
                        if self.transaction_type == TransactionType::ServerInvite =>
                    {
                        // Timer G, re-send the non-2xx final
                        if let Some(resp) = self.last_response.clone() {
                            if let Some(connection) = self.connection.as_ref() {
                                trace!(%key, ?interval, "retransmitting final response");
                                connection.send(resp.into(), None).await?;
                            }
                        }
                        self.schedule_retransmit_doubled(interval);
                    }
                    _ => {}
                }
                Ok(None)
            }
            TransactionTimer::Timeout(key) => match self.state {
                TransactionState::Calling
                | TransactionState::Trying
                | TransactionState::Proceeding
                    if matches!(
                        self.transaction_type,
                        TransactionType::ClientInvite | TransactionType::ClientNonInvite
                    ) =>
                {
                    // Timers B and F, surface a local 408 and die.
                    // Timer F keeps running through Proceeding: a
                    // provisional does not stop the non-INVITE clock.
                    debug!(%key, "transaction timeout, no final response");
                    let resp = make_timeout_response(&self.original)?;
                    self.last_response.replace(resp.clone());
                    self.transition(TransactionState::Terminated)?;
                    Ok(Some(resp.into()))
                }
                TransactionState::Completed
                    if self.transaction_type == TransactionType::ServerInvite =>
                {
                    // Timer H, the ACK never came
                    warn!(%key, "no ACK for final response, terminating");
                    self.transition(TransactionState::Terminated)?;
                    Ok(None)
                }
                _ => Ok(None),
            },
            TransactionTimer::Linger(key) => {
                // Timers D, I, J, K, L, M
                trace!(%key, "linger expired");
                self.transition(TransactionState::Terminated)?;
                Ok(None)
            }
            TransactionTimer::Provisional(_) => {
                if self.state == TransactionState::Proceeding
                    && self.transaction_type == TransactionType::ServerInvite
                {
                    if let Some(resp) = self.last_response.clone() {
                        if resp.status_code.kind() == StatusCodeKind::Provisional {
                            if let Some(connection) = self.connection.as_ref() {
                                connection.send(resp.into(), None).await?;
                            }
                        }
                    }
                    self.timer_provisional.replace(
                        self.endpoint_inner.timers.timeout(
                            self.endpoint_inner.option.provisional_interval,
                            TransactionTimer::Provisional(self.key.clone()),
                        ),
                    );
                }
                Ok(None)
            }
            TransactionTimer::Purge(_) => Ok(None),
        }
    }

    fn schedule_retransmit_doubled(&mut self, last_interval: std::time::Duration) {
        if !self.is_unreliable() {
            return;
        }
        let next = match self.transaction_type {
            // Timer A doubles without cap
            TransactionType::ClientInvite => last_interval * 2,
            // Timers E and G double up to T2
            _ => (last_interval * 2).min(self.endpoint_inner.option.t2),
        };
        self.timer_retransmit.replace(
            self.endpoint_inner
                .timers
                .timeout(next, TransactionTimer::Retransmit(self.key.clone(), next)),
        );
    }

    async fn send_response(&mut self, response: Response) -> Result<()> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection for response".to_string(), self.key.clone())
        })?;
        connection.send(response.to_owned().into(), None).await?;
        self.last_response.replace(response);
        Ok(())
    }

    fn transition(&mut self, state: TransactionState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        let option = self.endpoint_inner.option.clone();
        match state {
            TransactionState::Idle => {}
            TransactionState::Calling | TransactionState::Trying => {
                match self.transaction_type {
                    TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                        if self.is_unreliable() {
                            self.timer_retransmit.replace(self.endpoint_inner.timers.timeout(
                                option.t1,
                                TransactionTimer::Retransmit(self.key.clone(), option.t1),
                            ));
                        }
                        self.timer_timeout.replace(self.endpoint_inner.timers.timeout(
                            option.t1x64,
                            TransactionTimer::Timeout(self.key.clone()),
                        ));
                    }
                    _ => {}
                }
            }
            TransactionState::Proceeding => {
                self.cancel_timer(|tx| &mut tx.timer_retransmit);
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        // provisional received, Timer B stops
                        self.cancel_timer(|tx| &mut tx.timer_timeout);
                    }
                    TransactionType::ServerInvite => {
                        self.timer_provisional.replace(self.endpoint_inner.timers.timeout(
                            option.provisional_interval,
                            TransactionTimer::Provisional(self.key.clone()),
                        ));
                    }
                    _ => {}
                }
            }
            TransactionState::Completed => {
                self.cancel_timer(|tx| &mut tx.timer_retransmit);
                self.cancel_timer(|tx| &mut tx.timer_timeout);
                self.cancel_timer(|tx| &mut tx.timer_provisional);
                let unreliable = self.is_unreliable();
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        // Timer D
                        if unreliable {
                            self.timer_linger.replace(self.endpoint_inner.timers.timeout(
                                option.timer_d,
                                TransactionTimer::Linger(self.key.clone()),
                            ));
                        } else {
                            return self.transition(TransactionState::Terminated);
                        }
                    }
                    TransactionType::ClientNonInvite => {
                        // Timer K
                        if unreliable {
                            self.timer_linger.replace(self.endpoint_inner.timers.timeout(
                                option.t4,
                                TransactionTimer::Linger(self.key.clone()),
                            ));
                        } else {
                            return self.transition(TransactionState::Terminated);
                        }
                    }
                    TransactionType::ServerInvite => {
                        // Timers G and H
                        if unreliable {
                            self.timer_retransmit.replace(self.endpoint_inner.timers.timeout(
                                option.t1,
                                TransactionTimer::Retransmit(self.key.clone(), option.t1),
                            ));
                        }
                        self.timer_timeout.replace(self.endpoint_inner.timers.timeout(
                            option.t1x64,
                            TransactionTimer::Timeout(self.key.clone()),
                        ));
                    }
                    TransactionType::ServerNonInvite => {
                        // Timer J
                        if unreliable {
                            self.timer_linger.replace(self.endpoint_inner.timers.timeout(
                                option.t1x64,
                                TransactionTimer::Linger(self.key.clone()),
                            ));
                        } else {
                            return self.transition(TransactionState::Terminated);
                        }
                    }
                }
            }
            TransactionState::Accepted => {
                self.cancel_timer(|tx| &mut tx.timer_retransmit);
                self.cancel_timer(|tx| &mut tx.timer_timeout);
                self.cancel_timer(|tx| &mut tx.timer_provisional);
                // Timers L and M, RFC 6026: keep absorbing while 2xx
                // retransmissions can still arrive
                self.timer_linger.replace(
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::Linger(self.key.clone())),
                );
            }
            TransactionState::Confirmed => {
                self.cancel_timer(|tx| &mut tx.timer_retransmit);
                self.cancel_timer(|tx| &mut tx.timer_timeout);
                // Timer I
                if self.is_unreliable() {
                    self.timer_linger.replace(
                        self.endpoint_inner
                            .timers
                            .timeout(option.t4, TransactionTimer::Linger(self.key.clone())),
                    );
                } else {
                    debug!(key = %self.key, "transition {:?} -> {:?}", self.state, state);
                    self.state = state;
                    return self.transition(TransactionState::Terminated);
                }
            }
            TransactionState::Terminated => {
                self.cleanup();
            }
        }
        debug!(key = %self.key, "transition {:?} -> {:?}", self.state, state);
        self.state = state;
        Ok(())
    }

    fn cancel_timer(&mut self, f: impl Fn(&mut Self) -> &mut Option<u64>) {
        if let Some(id) = f(self).take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cleanup(&mut self) {
        if self.is_cleaned_up {
            return;
        }
        self.is_cleaned_up = true;
        self.cancel_timer(|tx| &mut tx.timer_retransmit);
        self.cancel_timer(|tx| &mut tx.timer_timeout);
        self.cancel_timer(|tx| &mut tx.timer_linger);
        self.cancel_timer(|tx| &mut tx.timer_provisional);
        self.endpoint_inner
            .detach_transaction(&self.key, self.last_response.take());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
    }
}
