//! Transport trait and the credentials-refreshing request wrapper.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::error::{FsError, Result};

use super::messages::{MasterRequest, MasterResponse};

/// Marks a gid as an index into the registered supplementary-group sets
/// rather than a plain group id.
pub const SECONDARY_GROUPS_BIT: u32 = 1 << 31;

/// Typed request/response channel to the master. Implementations own the
/// connection, the framing and the retry-on-reconnect logic; one in-flight
/// request per call.
pub trait MasterTransport: Send + Sync {
    fn request<'a>(
        &'a self,
        request: MasterRequest,
    ) -> Pin<Box<dyn Future<Output = Result<MasterResponse>> + Send + 'a>>;
}

/// Cache of registered supplementary-group sets, keyed by a small index the
/// master knows us by.
#[derive(Default)]
struct GroupCache {
    sets: Vec<Vec<u32>>,
    index_by_set: HashMap<Vec<u32>, u32>,
}

impl GroupCache {
    fn find(&self, groups: &[u32]) -> Option<u32> {
        self.index_by_set.get(groups).copied()
    }

    fn put(&mut self, groups: Vec<u32>) -> u32 {
        let index = self.sets.len() as u32;
        self.sets.push(groups.clone());
        self.index_by_set.insert(groups, index);
        index
    }

    fn by_index(&self, index: u32) -> Option<Vec<u32>> {
        self.sets.get(index as usize).cloned()
    }
}

/// The master as the rest of the crate sees it: typed operations with the
/// supplementary-group refresh baked in.
///
/// When the master answers `GroupNotRegistered` (it forgot our registered
/// gid set, e.g. after a failover), the wrapper re-registers the set with
/// `UPDATE_CREDENTIALS` and retries the original request exactly once.
pub struct Master {
    transport: Arc<dyn MasterTransport>,
    groups: Mutex<GroupCache>,
}

impl Master {
    pub fn new(transport: Arc<dyn MasterTransport>) -> Self {
        Self { transport, groups: Mutex::new(GroupCache::default()) }
    }

    /// Register a supplementary-group set and return the gid token to use
    /// in requests (index with the secondary-groups bit set).
    pub async fn register_groups(&self, groups: Vec<u32>) -> Result<u32> {
        let existing = self.groups.lock().find(&groups);
        if let Some(index) = existing {
            return Ok(index | SECONDARY_GROUPS_BIT);
        }
        let index = self.groups.lock().put(groups.clone());
        self.transport
            .request(MasterRequest::UpdateCredentials { index, gids: groups })
            .await
            .map(|_| ())?;
        Ok(index | SECONDARY_GROUPS_BIT)
    }

    pub async fn request(&self, request: MasterRequest) -> Result<MasterResponse> {
        match self.transport.request(request.clone()).await {
            Err(FsError::GroupNotRegistered) => {
                let Some(index) = request_group_index(&request) else {
                    return Err(FsError::GroupNotRegistered);
                };
                let Some(gids) = self.groups.lock().by_index(index) else {
                    warn!("master forgot credentials index {} we never registered", index);
                    return Err(FsError::GroupNotRegistered);
                };
                self.transport
                    .request(MasterRequest::UpdateCredentials { index, gids })
                    .await?;
                self.transport.request(request).await
            }
            other => other,
        }
    }
}

/// Credentials index carried by a request, if its gid is an index token.
fn request_group_index(request: &MasterRequest) -> Option<u32> {
    let gid = match request {
        MasterRequest::Lookup { gid, .. }
        | MasterRequest::GetAttr { gid, .. }
        | MasterRequest::SetAttr { gid, .. }
        | MasterRequest::Mkdir { gid, .. }
        | MasterRequest::Rmdir { gid, .. }
        | MasterRequest::Mknod { gid, .. }
        | MasterRequest::Unlink { gid, .. }
        | MasterRequest::Link { gid, .. }
        | MasterRequest::Symlink { gid, .. }
        | MasterRequest::Rename { gid, .. }
        | MasterRequest::Readdir { gid, .. }
        | MasterRequest::Open { gid, .. }
        | MasterRequest::GetAcl { gid, .. }
        | MasterRequest::TruncateBegin { gid, .. }
        | MasterRequest::TruncateEnd { gid, .. } => *gid,
        _ => return None,
    };
    if gid & SECONDARY_GROUPS_BIT != 0 {
        Some(gid ^ SECONDARY_GROUPS_BIT)
    } else {
        None
    }
}
