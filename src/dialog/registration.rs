use super::authenticate::Credential;
use crate::{
    rsip_ext::RsipResponseExt,
    transaction::{
        endpoint::EndpointInnerRef,
        make_call_id, make_tag,
        sender::{RequestApplicant, RequestSender},
    },
    transport::SipAddr,
    Error, Result,
};
use async_trait::async_trait;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Response, StatusCode,
};
use std::sync::Mutex;
use tracing::info;

/// REGISTER client for one address-of-record.
///
/// Keeps the Call-ID and CSeq stable across refreshes and tracks the
/// public address the registrar reports through the Via `received` and
/// `rport` parameters, for use in later Contact headers.
///
/// Not thread-safe; drive it from a single task.
pub struct Registration {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    pub contact: Option<rsip::typed::Contact>,
    pub allow: rsip::headers::Allow,
    /// Address the registrar saw us from, if it differs from ours.
    pub public_address: Option<rsip::HostWithPort>,
    pub call_id: rsip::headers::CallId,
}

/// Collects the Via `received` address from whatever responses the
/// sender surfaces, challenges included.
struct ViaObserver {
    received: Mutex<Option<rsip::HostWithPort>>,
}

#[async_trait]
impl RequestApplicant for ViaObserver {
    async fn receive_response(&self, resp: &Response) {
        if let Some(addr) = resp.via_received() {
            self.received.lock().map(|mut r| r.replace(addr)).ok();
        }
    }
}

impl Registration {
    pub fn new(endpoint: EndpointInnerRef, credential: Option<Credential>) -> Self {
        let call_id = make_call_id(endpoint.option.callid_suffix.as_deref());
        Self {
            last_seq: 0,
            endpoint,
            credential,
            contact: None,
            allow: Default::default(),
            public_address: None,
            call_id,
        }
    }

    pub fn discovered_public_address(&self) -> Option<rsip::HostWithPort> {
        self.public_address.clone()
    }

    /// Seconds until the current registration lapses, from the
    /// registrar's Contact `expires` parameter.
    pub fn expires(&self) -> u32 {
        self.contact
            .as_ref()
            .and_then(|c| c.expires())
            .map(|e| e.seconds().unwrap_or(50))
            .unwrap_or(50)
    }

    /// Send a REGISTER and wait for the final response, answering a
    /// digest challenge when credentials are available. Pass
    /// `expires` of 0 to unregister.
    pub async fn register(&mut self, server: rsip::Uri, expires: Option<u32>) -> Result<Response> {
        self.last_seq += 1;

        let mut to = rsip::typed::To {
            display_name: None,
            uri: server.clone(),
            params: vec![],
        };
        if let Some(cred) = &self.credential {
            to.uri.auth = Some(rsip::auth::Auth {
                user: cred.username.clone(),
                password: None,
            });
        }

        let from = rsip::typed::From {
            display_name: None,
            uri: to.uri.clone(),
            params: vec![],
        }
        .with_tag(make_tag());

        let via = self.endpoint.get_via(None, None)?;

        // Prefer the registrar's view of our address over the local
        // one: response Contact, then discovered public address, then
        // the Via we are about to send.
        let contact = self.contact.clone().unwrap_or_else(|| {
            let contact_host_with_port = self
                .public_address
                .clone()
                .unwrap_or_else(|| via.uri.host_with_port.clone());
            rsip::typed::Contact {
                display_name: None,
                uri: rsip::Uri {
                    auth: to.uri.auth.clone(),
                    scheme: Some(rsip::Scheme::Sip),
                    host_with_port: contact_host_with_port,
                    params: vec![],
                    headers: vec![],
                },
                params: vec![],
            }
        });

        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Via(via.into()));
        headers.push(rsip::Header::CallId(self.call_id.clone()));
        headers.push(rsip::Header::From(from.into()));
        headers.push(rsip::Header::To(to.into()));
        headers.push(rsip::Header::CSeq(
            rsip::typed::CSeq {
                seq: self.last_seq,
                method: rsip::Method::Register,
            }
            .into(),
        ));
        headers.push(rsip::Header::UserAgent(
            self.endpoint.user_agent.clone().into(),
        ));
        headers.push(contact.into());
        headers.push(self.allow.clone().into());
        headers.push(rsip::Header::MaxForwards(70.into()));
        if let Some(expires) = expires {
            headers.push(rsip::headers::Expires::from(expires).into());
        }
        headers.push(rsip::Header::ContentLength(0u32.into()));

        let request = rsip::Request {
            method: rsip::Method::Register,
            uri: server,
            headers,
            body: vec![],
            version: rsip::Version::V2,
        };

        let observer = ViaObserver {
            received: Mutex::new(None),
        };
        let mut sender = RequestSender::new(self.endpoint.clone(), self.credential.clone());
        let resp = sender.send(request, &observer).await?.ok_or_else(|| {
            Error::EndpointError("registration transaction ended without response".to_string())
        })?;

        // the sender bumps CSeq when it answers a challenge
        if let Ok(cseq) = resp.cseq_header().and_then(|c| c.typed()) {
            self.last_seq = cseq.seq;
        }

        let received = resp
            .via_received()
            .or_else(|| observer.received.lock().ok().and_then(|r| r.clone()));
        if received.is_some() && self.public_address != received {
            info!(
                "discovered public address: {:?} -> {:?}",
                self.public_address, received
            );
            self.public_address = received;
            self.contact = None;
        }

        if resp.status_code == StatusCode::OK {
            if let Ok(contact) = resp.contact_header() {
                self.contact = contact.typed().ok();
            }
        }
        info!(status = %resp.status_code, "registration done");
        Ok(resp)
    }

    /// Contact for later dialogs, preferring the public address the
    /// registrar reported.
    pub fn create_nat_aware_contact(
        username: &str,
        public_address: Option<rsip::HostWithPort>,
        local_address: &SipAddr,
    ) -> rsip::typed::Contact {
        let contact_host_with_port = public_address.unwrap_or_else(|| local_address.addr.clone());
        rsip::typed::Contact {
            display_name: None,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sip),
                auth: Some(rsip::Auth {
                    user: username.to_string(),
                    password: None,
                }),
                host_with_port: contact_host_with_port,
                params: vec![],
                headers: vec![],
            },
            params: vec![],
        }
    }
}
