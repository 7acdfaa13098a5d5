use super::{
    key::{Rfc2543, Rfc3261, TransactionKey, TransactionRole},
    timer::Timer,
    transaction::{Transaction, TransactionEvent, TransactionEventSender, TransactionReceiver},
    TransactionTimer, T1, T1X64, T2, T4, TIMER_INTERVAL_PROVISIONAL,
};
use crate::transport::{SipAddr, SipConnection, TransportEvent, TransportLayer};
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::SipMessage;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const USER_AGENT: &str = "sipflow/0.2";

/// RFC 3261 timing knobs. Tests shrink these to run transaction
/// lifetimes in milliseconds.
#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// 64*T1, the give-up timeout (Timers B, F, H and the accepted
    /// linger L/M).
    pub t1x64: Duration,
    /// Timer D, how long a client INVITE absorbs retransmitted finals.
    pub timer_d: Duration,
    /// How often a server INVITE re-sends its latest provisional.
    pub provisional_interval: Duration,
    /// Suffix for generated Call-IDs, normally the local domain.
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: T1,
            t2: T2,
            t4: T4,
            t1x64: T1X64,
            timer_d: Duration::from_secs(32),
            provisional_interval: TIMER_INTERVAL_PROVISIONAL,
            callid_suffix: None,
        }
    }
}

pub struct EndpointInner {
    pub user_agent: String,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    pub option: EndpointOption,
    pub timer_interval: Duration,

    transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    /// Terminated transactions keep their final response here so the
    /// endpoint can replay it to straggling retransmissions without a
    /// live state machine.
    finished_transactions: Mutex<HashMap<TransactionKey, Option<rsip::Response>>>,
    incoming_sender: Mutex<Option<UnboundedSender<Transaction>>>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// The transaction-layer endpoint: owns the transports, the timer
/// wheel and the registry matching wire messages to transactions.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
    cancel_token: CancellationToken,
}

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    timer_interval: Option<Duration>,
    option: Option<EndpointOption>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            transport_layer: None,
            cancel_token: None,
            timer_interval: None,
            option: None,
        }
    }

    pub fn with_user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn with_timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.timer_interval.replace(timer_interval);
        self
    }

    pub fn with_option(&mut self, option: EndpointOption) -> &mut Self {
        self.option.replace(option);
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self.transport_layer.take().unwrap_or_else(|| {
            TransportLayer::new(cancel_token.child_token())
        });

        let inner = Arc::new(EndpointInner {
            user_agent: self.user_agent.clone(),
            timers: Timer::new(),
            transport_layer,
            cancel_token: cancel_token.child_token(),
            option: self.option.take().unwrap_or_default(),
            timer_interval: self
                .timer_interval
                .take()
                .unwrap_or(Duration::from_millis(20)),
            transactions: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            incoming_sender: Mutex::new(None),
        });

        Endpoint {
            inner,
            cancel_token,
        }
    }
}

impl Endpoint {
    /// Run the endpoint until cancelled. Polls the timer wheel and
    /// drains the transports.
    pub async fn serve(&self) {
        let inner = self.inner.clone();
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            },
            r = inner.process_timer() => {
                if let Err(e) = r {
                    warn!("endpoint timer loop error: {:?}", e);
                }
            },
            r = self.inner.process_transport_layer() => {
                if let Err(e) = r {
                    warn!("endpoint transport loop error: {:?}", e);
                }
            },
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.cancel_token.cancel();
    }

    /// Channel of server transactions created from incoming requests.
    /// Dropping the receiver makes the endpoint reject new work.
    pub fn incoming_transactions(&self) -> TransactionReceiver {
        let (tx, rx) = unbounded_channel();
        self.inner
            .incoming_sender
            .lock()
            .map(|mut s| s.replace(tx))
            .ok();
        rx
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.transport_layer.get_addrs()
    }
}

impl EndpointInner {
    async fn process_timer(&self) -> Result<()> {
        loop {
            for t in self.timers.poll(Instant::now()) {
                if let TransactionTimer::Purge(key) = &t {
                    self.finished_transactions
                        .lock()
                        .map(|mut ft| ft.remove(key))
                        .ok();
                    continue;
                }
                if let Some(sender) = self.lookup_transaction(t.key()) {
                    if sender.send(TransactionEvent::Timer(t)).is_err() {
                        // receiver dropped between lookup and send
                        continue;
                    }
                } else {
                    trace!("timer for detached transaction: {}", t);
                }
            }
            tokio::time::sleep(self.timer_interval).await;
        }
    }

    async fn process_transport_layer(self: &Arc<Self>) -> Result<()> {
        let (transport_tx, mut transport_rx) = unbounded_channel();
        self.transport_layer.serve_listens(transport_tx).await?;
        while let Some(event) = transport_rx.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, from) => {
                    if let Err(e) = self.on_received_message(msg, connection, &from).await {
                        debug!(%from, "error handling incoming message: {:?}", e);
                    }
                }
                TransportEvent::New(t) => {
                    debug!("new connection {}", t);
                }
                TransportEvent::Closed(t) => {
                    debug!("connection closed {}", t);
                }
            }
        }
        Ok(())
    }

    /// The RFC 17.2/17.1.3 matching rules: hand the message to a live
    /// transaction, replay cached finals at retransmissions, and only
    /// surface genuinely new requests to the TU.
    async fn on_received_message(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        from: &SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => self.on_received_request(req, connection, from).await,
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp, TransactionRole::Client)?;
                if let Some(sender) = self.lookup_transaction(&key) {
                    sender
                        .send(TransactionEvent::Received(resp.into(), Some(connection)))
                        .map_err(|e| Error::TransactionError(e.to_string(), key))?;
                } else {
                    trace!(%key, "response without matching client transaction");
                }
                Ok(())
            }
        }
    }

    async fn on_received_request(
        self: &Arc<Self>,
        req: rsip::Request,
        connection: SipConnection,
        from: &SipAddr,
    ) -> Result<()> {
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;

        // ACK shares the INVITE's key, so a live INVITE server
        // transaction absorbs it here. CANCEL gets its own key and
        // becomes its own server transaction; the dialog layer matches
        // it to the INVITE it cancels.
        if let Some(sender) = self.lookup_transaction(&key) {
            sender
                .send(TransactionEvent::Received(req.into(), Some(connection)))
                .map_err(|e| Error::TransactionError(e.to_string(), key))?;
            return Ok(());
        }

        if req.method == rsip::Method::Ack {
            if self.is_finished(&key) {
                // ACK for a non-2xx final whose transaction already
                // terminated
                trace!(%key, "absorbing ACK for finished transaction");
                return Ok(());
            }
            // ACK for a 2xx travels outside the INVITE transaction and
            // belongs to the dialog; surface it.
        } else {
            // retransmission of a request whose transaction already
            // terminated: replay the cached final response
            if let Some(last_response) = self.get_finished_response(&key) {
                debug!(%key, "replaying cached final to retransmission");
                connection.send(last_response.into(), Some(from)).await?;
                return Ok(());
            }
            if self.is_finished(&key) {
                trace!(%key, "absorbing retransmission of finished transaction");
                return Ok(());
            }
        }

        if req.method == rsip::Method::Cancel {
            // RFC 3261 section 9.2: a CANCEL matching no INVITE server
            // transaction is answered 481 and goes no further. The
            // INVITE shares the CANCEL's branch with method INVITE.
            let invite_key = match &key {
                TransactionKey::RFC3261(k) => TransactionKey::RFC3261(Rfc3261 {
                    method: rsip::Method::Invite,
                    ..k.clone()
                }),
                TransactionKey::RFC2543(k) => TransactionKey::RFC2543(Rfc2543 {
                    method: rsip::Method::Invite,
                    ..k.clone()
                }),
                TransactionKey::Invalid => key.clone(),
            };
            if self.lookup_transaction(&invite_key).is_none() && !self.is_finished(&invite_key) {
                debug!(%key, "CANCEL without matching INVITE transaction");
                let mut tx = Transaction::new_server(key, req, self.clone(), Some(connection));
                tx.reply(rsip::StatusCode::CallTransactionDoesNotExist)
                    .await?;
                return Ok(());
            }
        }

        let mut tx = Transaction::new_server(key, req, self.clone(), Some(connection));
        if tx.original.method == rsip::Method::Invite {
            tx.send_trying().await?;
        }

        let sender = self
            .incoming_sender
            .lock()
            .map(|s| s.clone())
            .map_err(|e| Error::EndpointError(e.to_string()))?;
        match sender {
            Some(sender) => sender
                .send(tx)
                .map_err(|e| Error::EndpointError(e.to_string()))?,
            None => {
                warn!("no incoming transaction receiver, rejecting request");
                tx.reply(rsip::StatusCode::ServerInternalError).await?;
            }
        }
        Ok(())
    }

    pub fn attach_transaction(&self, key: &TransactionKey, tu_sender: TransactionEventSender) {
        trace!(%key, "attach transaction");
        self.transactions
            .lock()
            .map(|mut ts| ts.insert(key.clone(), tu_sender))
            .ok();
    }

    pub fn detach_transaction(&self, key: &TransactionKey, last_message: Option<rsip::Response>) {
        trace!(%key, "detach transaction");
        self.transactions.lock().map(|mut ts| ts.remove(key)).ok();

        if let Some(msg) = last_message {
            if msg.status_code.kind() == rsip::StatusCodeKind::Provisional {
                return;
            }
            self.timers
                .timeout(self.option.t1x64, TransactionTimer::Purge(key.clone()));
            self.finished_transactions
                .lock()
                .map(|mut ft| ft.insert(key.clone(), Some(msg)))
                .ok();
        }
    }

    pub fn lookup_transaction(&self, key: &TransactionKey) -> Option<TransactionEventSender> {
        self.transactions
            .lock()
            .ok()
            .and_then(|ts| ts.get(key).cloned())
    }

    fn is_finished(&self, key: &TransactionKey) -> bool {
        self.finished_transactions
            .lock()
            .map(|ft| ft.contains_key(key))
            .unwrap_or_default()
    }

    fn get_finished_response(&self, key: &TransactionKey) -> Option<rsip::Response> {
        self.finished_transactions
            .lock()
            .ok()
            .and_then(|ft| ft.get(key).cloned().flatten())
    }

    /// Topmost Via for requests this endpoint originates.
    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = match addr {
            Some(addr) => addr,
            None => self
                .transport_layer
                .get_addrs()
                .first()
                .cloned()
                .ok_or_else(|| Error::EndpointError("endpoint has no transport".to_string()))?,
        };
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            },
            params: vec![
                branch.unwrap_or_else(super::make_via_branch),
                rsip::Param::Other("rport".into(), None),
            ],
        })
    }

    pub fn make_response(
        &self,
        req: &rsip::Request,
        status: rsip::StatusCode,
        body: Option<Vec<u8>>,
    ) -> rsip::Response {
        let mut headers = rsip::Headers::default();
        for header in req.headers.iter() {
            match header {
                rsip::Header::Via(_)
                | rsip::Header::CallId(_)
                | rsip::Header::From(_)
                | rsip::Header::To(_)
                | rsip::Header::CSeq(_)
                | rsip::Header::RecordRoute(_) => headers.push(header.clone()),
                _ => {}
            }
        }
        headers.push(rsip::Header::UserAgent(self.user_agent.clone().into()));
        headers.push(rsip::Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        rsip::Response {
            status_code: status,
            version: req.version.clone(),
            headers,
            body: body.unwrap_or_default(),
        }
    }
}

/// Synthesize the local 408 a client transaction reports when Timer B
/// or F fires without any final response from the wire.
pub fn make_timeout_response(req: &rsip::Request) -> Result<rsip::Response> {
    let mut headers = rsip::Headers::default();
    headers.push(rsip::Header::Via(req.via_header()?.clone()));
    headers.push(rsip::Header::CallId(req.call_id_header()?.clone()));
    headers.push(rsip::Header::From(req.from_header()?.clone()));
    headers.push(rsip::Header::To(req.to_header()?.clone()));
    headers.push(rsip::Header::CSeq(req.cseq_header()?.clone()));
    headers.push(rsip::Header::ContentLength(0u32.into()));
    Ok(rsip::Response {
        status_code: rsip::StatusCode::RequestTimeout,
        version: req.version.clone(),
        headers,
        body: Default::default(),
    })
}
