use super::{connection::TransportSender, SipAddr, SipConnection, TransportEvent};
use crate::Result;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct TransportLayerInner {
    cancel_token: CancellationToken,
    listens: Arc<Mutex<HashMap<SipAddr, SipConnection>>>,
}

/// Registry of live connections plus the outgoing-connection picker.
///
/// Connection-state policy (reconnects, failover) lives above this layer;
/// here a missing connection is simply an error surfaced to the
/// transaction that tried to send.
#[derive(Default)]
pub struct TransportLayer {
    pub outbound: Option<SipAddr>,
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            outbound: None,
            inner: Arc::new(TransportLayerInner {
                cancel_token,
                listens: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn add_transport(&self, connection: SipConnection) {
        self.inner
            .listens
            .lock()
            .map(|mut listens| listens.insert(connection.get_addr().to_owned(), connection))
            .ok();
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        self.inner
            .listens
            .lock()
            .map(|mut listens| listens.remove(addr))
            .ok();
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner
            .listens
            .lock()
            .map(|listens| listens.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Pick the connection to reach `uri`, honoring the configured
    /// outbound proxy first.
    pub fn lookup(&self, uri: &rsip::uri::Uri) -> Result<SipConnection> {
        let target = match self.outbound.as_ref() {
            Some(addr) => addr.clone(),
            None => {
                let mut r#type = uri.scheme.as_ref().map(|scheme| match scheme {
                    rsip::Scheme::Sip => rsip::transport::Transport::Udp,
                    rsip::Scheme::Sips => rsip::transport::Transport::Tls,
                    rsip::Scheme::Other(schema) => {
                        if schema.eq_ignore_ascii_case("ws") {
                            rsip::transport::Transport::Ws
                        } else if schema.eq_ignore_ascii_case("wss") {
                            rsip::transport::Transport::Wss
                        } else {
                            rsip::transport::Transport::Udp
                        }
                    }
                });
                for param in uri.params.iter() {
                    if let rsip::Param::Transport(transport) = param {
                        r#type = Some(transport.clone());
                    }
                }
                SipAddr {
                    r#type,
                    addr: uri.host_with_port.to_owned(),
                }
            }
        };

        debug!("lookup target: {} -> {}", uri, target);

        let listens = self
            .inner
            .listens
            .lock()
            .map_err(|e| crate::Error::Error(e.to_string()))?;
        if let Some(connection) = listens.get(&target) {
            return Ok(connection.clone());
        }

        // No exact match: any connection of the same transport family will
        // do (UDP sockets can reach arbitrary peers, channels are point to
        // point test fixtures).
        for connection in listens.values() {
            if connection.get_addr().r#type == target.r#type || target.r#type.is_none() {
                return Ok(connection.clone());
            }
        }
        if let Some(connection) = listens.values().next() {
            return Ok(connection.clone());
        }

        Err(crate::Error::TransportLayerError(
            "no connection available".to_string(),
            target,
        ))
    }

    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        let listens = self
            .inner
            .listens
            .lock()
            .map(|listens| listens.clone())
            .map_err(|e| crate::Error::Error(e.to_string()))?;
        for (_, connection) in listens {
            let sub_token = self.inner.cancel_token.child_token();
            let sender_clone = sender.clone();
            let listens_ref = self.inner.listens.clone();

            tokio::spawn(async move {
                select! {
                    _ = sub_token.cancelled() => {}
                    _ = connection.serve_loop(sender_clone.clone()) => {}
                }
                listens_ref
                    .lock()
                    .map(|mut listens| listens.remove(connection.get_addr()))
                    .ok();
                warn!("connection serve_loop exited: {}", connection.get_addr());
                sender_clone.send(TransportEvent::Closed(connection)).ok();
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{transport::udp::UdpConnection, Result};

    #[tokio::test]
    async fn test_lookup() -> Result<()> {
        let mut tl = super::TransportLayer::new(tokio_util::sync::CancellationToken::new());

        let first_uri = "sip:bob@127.0.0.1:5060".try_into().expect("parse uri");
        assert!(tl.lookup(&first_uri).is_err());

        let udp_peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
        let udp_peer_addr = udp_peer.get_addr().to_owned();
        tl.add_transport(udp_peer.into());

        let target = tl.lookup(&first_uri)?;
        assert_eq!(target.get_addr(), &udp_peer_addr);

        // outbound proxy wins over the request URI
        let outbound_peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
        let outbound = outbound_peer.get_addr().to_owned();
        tl.add_transport(outbound_peer.into());
        tl.outbound = Some(outbound.clone());

        let target = tl.lookup(&first_uri)?;
        assert_eq!(target.get_addr(), &outbound);
        Ok(())
    }
}
