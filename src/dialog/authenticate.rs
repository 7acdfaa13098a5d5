use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_cnonce, make_via_branch};
use crate::{Error, Result};
use rsip::headers::auth::AuthQop;
use rsip::prelude::{HasHeaders, HeadersExt, ToTypedHeader};
use rsip::services::DigestGenerator;
use rsip::typed::{Authorization, ProxyAuthorization};
use rsip::{Header, Param, Response, StatusCode};

#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Restrict this credential to a realm. `None` answers any
    /// challenge.
    pub realm: Option<String>,
}

/// Does a 401/407 carry `stale=true`, meaning the nonce expired and a
/// retry with the same credential is worth one more attempt.
pub fn is_stale_challenge(resp: &Response) -> bool {
    challenge_of(resp)
        .and_then(|c| c.stale)
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn challenge_of(resp: &Response) -> Option<rsip::typed::WwwAuthenticate> {
    resp.headers.iter().find_map(|h| match h {
        Header::WwwAuthenticate(h) => h.typed().ok(),
        Header::ProxyAuthenticate(h) => h.typed().ok().map(|t| t.0),
        _ => None,
    })
}

/// Answer a digest challenge: clone the original request with a bumped
/// CSeq, a fresh Via branch and the computed Authorization or
/// Proxy-Authorization header, and wrap it in a new client transaction
/// keyed by the fresh branch.
pub async fn handle_client_authenticate(
    new_seq: u32,
    tx: Transaction,
    resp: Response,
    cred: &Credential,
) -> Result<Transaction> {
    let challenge = challenge_of(&resp).ok_or_else(|| {
        Error::Error(format!(
            "challenge response {} without authenticate header",
            resp.status_code
        ))
    })?;

    if let Some(realm) = cred.realm.as_ref() {
        if !realm.eq_ignore_ascii_case(challenge.realm.as_str()) {
            return Err(Error::Error(format!(
                "challenge realm {} does not match credential realm {}",
                challenge.realm, realm
            )));
        }
    }

    let mut new_req = tx.original.clone();
    new_req.cseq_header_mut()?.mut_seq(new_seq)?;

    let auth_qop = challenge.qop.as_ref().map(|_| AuthQop::Auth {
        cnonce: make_cnonce(),
        nc: 1,
    });

    let generator = DigestGenerator {
        username: cred.username.as_str(),
        password: cred.password.as_str(),
        algorithm: challenge.algorithm.unwrap_or_default(),
        nonce: challenge.nonce.as_str(),
        method: &tx.original.method,
        qop: auth_qop.as_ref(),
        uri: &tx.original.uri,
        realm: challenge.realm.as_str(),
    };

    let auth = Authorization {
        scheme: challenge.scheme,
        username: cred.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: tx.original.uri.clone(),
        response: generator.compute(),
        algorithm: challenge.algorithm,
        opaque: challenge.opaque,
        qop: auth_qop,
    };

    let mut via = tx.original.via_header()?.typed()?;
    via.params.retain(|k| !matches!(k, Param::Branch(_)));
    via.params.push(make_via_branch());
    new_req.headers_mut().unique_push(via.into());

    new_req.headers_mut().retain(|h| {
        !matches!(
            h,
            Header::Authorization(_) | Header::ProxyAuthorization(_)
        )
    });
    match resp.status_code {
        StatusCode::ProxyAuthenticationRequired => {
            new_req
                .headers_mut()
                .unique_push(ProxyAuthorization(auth).into());
        }
        _ => {
            new_req.headers_mut().unique_push(auth.into());
        }
    }

    let key = TransactionKey::from_request(&new_req, TransactionRole::Client)?;
    let new_tx = Transaction::new_client(key, new_req, tx.endpoint_inner.clone(), tx.connection.clone());
    Ok(new_tx)
}
