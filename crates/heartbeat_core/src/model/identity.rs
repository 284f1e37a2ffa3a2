//! Installation identity used to key sink writes.

use serde::{Deserialize, Serialize};

/// Owner and public share identifiers for one installation.
///
/// `owner_id` is absent until the external identity bootstrap has signed the
/// installation in; `share_id` always exists once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareIdentity {
    pub owner_id: Option<String>,
    pub share_id: String,
}

impl ShareIdentity {
    pub fn new(owner_id: Option<String>, share_id: impl Into<String>) -> Self {
        Self {
            owner_id,
            share_id: share_id.into(),
        }
    }
}
