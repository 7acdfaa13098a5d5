use super::authenticate::Credential;
use super::client_dialog::ClientInviteDialog;
use super::dialog::{Dialog, DialogInner, DialogStateSender};
use super::server_dialog::ServerInviteDialog;
use super::DialogId;
use crate::transaction::key::TransactionRole;
use crate::transaction::make_tag;
use crate::transaction::{endpoint::EndpointInnerRef, transaction::Transaction};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Param, Request};
use std::sync::atomic::{AtomicU32, Ordering};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::info;

pub struct DialogLayerInner {
    pub(super) last_seq: AtomicU32,
    pub(super) dialogs: RwLock<HashMap<DialogId, Dialog>>,
}
pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

/// Registry of live dialogs keyed by [`DialogId`]. Server dialogs are
/// created from a surfaced INVITE transaction, client dialogs from an
/// outgoing INVITE request.
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        Self {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                last_seq: AtomicU32::new(0),
                dialogs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Look up the dialog a surfaced INVITE belongs to, or mint a new
    /// server dialog with a fresh to-tag.
    pub fn get_or_create_server_invite(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        contact: Option<rsip::Uri>,
    ) -> Result<ServerInviteDialog> {
        let mut id = DialogId::try_from(&tx.original)?;
        if !id.to_tag.is_empty() {
            let dlg = self
                .inner
                .dialogs
                .read()
                .map_err(|e| Error::Error(e.to_string()))?
                .get(&id)
                .cloned();
            match dlg {
                Some(Dialog::ServerInvite(dlg)) => return Ok(dlg),
                _ => {
                    return Err(Error::DialogError("dialog not found".to_string(), id));
                }
            }
        }
        id.to_tag = make_tag().to_string();

        let dlg_inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            state_sender,
            credential,
            contact,
        )?;

        let dialog = ServerInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        self.inner
            .dialogs
            .write()
            .map_err(|e| Error::Error(e.to_string()))?
            .insert(id.clone(), Dialog::ServerInvite(dialog.clone()));
        info!(%id, "server invite dialog created");
        Ok(dialog)
    }

    /// Build a client dialog around an outgoing INVITE. The request
    /// must carry a from-tag; the to-tag is learned from responses.
    pub fn create_client_invite(
        &self,
        mut request: Request,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        contact: Option<rsip::Uri>,
    ) -> Result<ClientInviteDialog> {
        let from = request.from_header()?.typed()?;
        if !from.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            let from = from.with_tag(make_tag());
            request
                .headers
                .unique_push(rsip::Header::From(from.into()));
        }
        let id = DialogId::try_from(&request)?;

        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request,
            self.endpoint.clone(),
            state_sender,
            credential,
            contact,
        )?;

        let dialog = ClientInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        self.inner
            .dialogs
            .write()
            .map_err(|e| Error::Error(e.to_string()))?
            .insert(id.clone(), Dialog::ClientInvite(dialog.clone()));
        info!(%id, "client invite dialog created");
        Ok(dialog)
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// `DialogId` equality ignores tag order, so one lookup covers the
    /// request arriving from either side.
    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner
            .dialogs
            .read()
            .ok()
            .and_then(|dialogs| dialogs.get(id).cloned())
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        info!(%id, "remove dialog");
        self.inner
            .dialogs
            .write()
            .ok()
            .and_then(|mut dialogs| dialogs.remove(id))
            .map(|d| d.on_remove());
    }

    pub fn match_dialog(&self, req: &Request) -> Option<Dialog> {
        let id = DialogId::try_from(req).ok()?;
        if let Some(dialog) = self.get_dialog(&id) {
            return Some(dialog);
        }
        if id.to_tag.is_empty() {
            // CANCEL and retransmitted initial INVITEs carry no to-tag
            let dialogs = self.inner.dialogs.read().ok()?;
            return dialogs
                .iter()
                .find(|(key, _)| {
                    key.call_id == id.call_id
                        && (key.from_tag == id.from_tag || key.to_tag == id.from_tag)
                })
                .map(|(_, dialog)| dialog.clone());
        }
        None
    }
}
