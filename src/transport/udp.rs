use super::{
    connection::{TransportEvent, TransportSender},
    SipAddr, SipConnection, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE,
};
use crate::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

struct UdpConnectionInner {
    conn: UdpSocket,
    addr: SipAddr,
}

/// Unreliable datagram connection; the transport that actually exercises
/// the retransmission timers (A/E/G) and the non-zero wait timers.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpConnectionInner>,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let local = conn.local_addr()?;

        let addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: external.unwrap_or(local).into(),
        };

        let t = UdpConnection {
            inner: Arc::new(UdpConnectionInner { conn, addr }),
        };
        info!("created UDP connection: {} external: {:?}", t, external);
        Ok(t)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                _ => {
                    if buf[..len].iter().all(|&b| b.is_ascii_whitespace()) {
                        continue;
                    }
                }
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    info!("non-utf8 datagram from {}: {}", addr, e);
                    continue;
                }
            };

            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("error parsing SIP message from {}: {}", addr, e);
                    continue;
                }
            };

            let msg = match SipConnection::update_msg_received(msg, addr) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("error updating received param: {}", e);
                    continue;
                }
            };

            debug!("received {} bytes {} -> {}", len, addr, self.get_addr());
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                addr.into(),
            ))?;
        }
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(addr) => addr.get_socketaddr()?,
            None => SipConnection::get_destination(&msg)?,
        };
        let buf = msg.to_string();
        trace!("sending {} bytes -> {}", buf.len(), target);

        self.inner
            .conn
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| {
                crate::Error::TransportLayerError(e.to_string(), self.get_addr().to_owned())
            })
            .map(|_| ())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}
