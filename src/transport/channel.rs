use super::{
    connection::{TransportEvent, TransportReceiver, TransportSender},
    SipAddr, SipConnection,
};
use crate::Result;
use std::sync::{Arc, Mutex};

struct ChannelConnectionInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SipAddr,
}

/// In-process loopback connection.
///
/// Everything sent through it is surfaced on the paired `outgoing` channel,
/// which makes it the transport of choice for deterministic tests: a test
/// plays the remote peer by reading `outgoing` and pushing replies into
/// `incoming`. Counts as a reliable transport, so the zero-duration wait
/// timers apply.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelConnectionInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelConnectionInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
            }),
        })
    }

    pub async fn send(&self, msg: rsip::SipMessage) -> Result<()> {
        let connection = SipConnection::Channel(self.clone());
        let source = self.get_addr().clone();
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(msg, connection, source))
            .map_err(|e| {
                crate::Error::TransportLayerError(e.to_string(), self.get_addr().to_owned())
            })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self
            .inner
            .incoming
            .lock()
            .map_err(|e| crate::Error::Error(e.to_string()))?
            .take();
        let mut incoming = incoming.ok_or_else(|| {
            crate::Error::Error("ChannelConnection::serve_loop called twice".to_string())
        })?;
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}
