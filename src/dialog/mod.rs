//! RFC 3261 section 12 dialogs on top of the transaction layer:
//! CSeq bookkeeping, route set and remote target tracking, and the
//! section 14 glare rules for competing re-INVITEs.

use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod authenticate;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod registration;
pub mod server_dialog;

#[cfg(test)]
mod tests;

pub use dialog_layer::DialogLayer;

/// Dialog identifier, Call-ID plus the two tags. Comparison and
/// hashing ignore which side each tag came from, so the id computed
/// from a UAC's request matches the one computed from the UAS's view
/// of the same dialog.
#[derive(Clone, Debug, Eq)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl DialogId {
    fn tags_sorted(&self) -> (&str, &str) {
        if self.from_tag <= self.to_tag {
            (self.from_tag.as_str(), self.to_tag.as_str())
        } else {
            (self.to_tag.as_str(), self.from_tag.as_str())
        }
    }

    /// The same dialog as seen from the other side.
    pub fn swapped(&self) -> Self {
        DialogId {
            call_id: self.call_id.clone(),
            from_tag: self.to_tag.clone(),
            to_tag: self.from_tag.clone(),
        }
    }
}

impl PartialEq for DialogId {
    fn eq(&self, other: &Self) -> bool {
        self.call_id == other.call_id && self.tags_sorted() == other.tags_sorted()
    }
}

impl std::hash::Hash for DialogId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.call_id.hash(state);
        self.tags_sorted().hash(state);
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
    }
}

impl TryFrom<&rsip::Request> for DialogId {
    type Error = Error;

    fn try_from(request: &rsip::Request) -> Result<Self> {
        let from_tag = request
            .from_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        let to_tag = request
            .to_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        Ok(DialogId {
            call_id: request.call_id_header()?.value().to_string(),
            from_tag,
            to_tag,
        })
    }
}

impl TryFrom<&rsip::Response> for DialogId {
    type Error = Error;

    fn try_from(response: &rsip::Response) -> Result<Self> {
        let from_tag = response
            .from_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        let to_tag = response
            .to_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        Ok(DialogId {
            call_id: response.call_id_header()?.value().to_string(),
            from_tag,
            to_tag,
        })
    }
}
