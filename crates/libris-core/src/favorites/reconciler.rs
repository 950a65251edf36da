use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError, ApiRequest, ApiResult};
use crate::auth::SessionManager;
use crate::models::{FavoriteList, ItemId, MembershipEntry, ToItemId, ToggleBody};

/// How a toggle is expressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStyle {
    /// `POST <toggle> {itemId, desiredState}`
    #[default]
    DesiredState,
    /// `POST <toggle> {itemId}` to add, `DELETE <toggle> {itemId}` to remove
    AddRemove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FavoritesEndpoints {
    pub list: String,
    pub toggle: String,
    pub style: MutationStyle,
    /// Query parameter naming whose list to fetch, filled from the
    /// credential's `user_id` claim. `None` fetches the bare list.
    pub owner_param: Option<String>,
}

impl Default for FavoritesEndpoints {
    fn default() -> Self {
        Self {
            list: "/articles/favorites/".to_string(),
            toggle: "/articles/favorites/".to_string(),
            style: MutationStyle::default(),
            owner_param: Some("user_pk".to_string()),
        }
    }
}

impl FavoritesEndpoints {
    /// List path, scoped to `owner` when both a parameter and an owner exist.
    pub fn list_path(&self, owner: Option<u64>) -> String {
        match (self.owner_param.as_deref(), owner) {
            (Some(param), Some(owner)) => {
                let sep = if self.list.contains('?') { '&' } else { '?' };
                format!("{}{}{}={}", self.list, sep, param, owner)
            }
            _ => self.list.clone(),
        }
    }
}

// ============================================================================
// Local state
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Overlay {
    present: bool,
    seq: u64,
}

/// Last server snapshot plus at most one unconfirmed overlay per item.
#[derive(Debug, Default)]
struct Ledger {
    snapshot: Vec<ItemId>,
    overlays: HashMap<ItemId, Overlay>,
    next_seq: u64,
    synced_at: Option<DateTime<Utc>>,
}

impl Ledger {
    fn contains(&self, id: ItemId) -> bool {
        match self.overlays.get(&id) {
            Some(overlay) => overlay.present,
            None => self.snapshot.contains(&id),
        }
    }

    /// Record an optimistic change, replacing any older overlay for `id`.
    fn overlay(&mut self, id: ItemId, present: bool) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.overlays.insert(id, Overlay { present, seq });
        seq
    }

    /// Undo an overlay, unless a newer toggle already replaced it.
    fn revert(&mut self, id: ItemId, seq: u64) {
        if self.overlays.get(&id).is_some_and(|o| o.seq == seq) {
            self.overlays.remove(&id);
        }
    }

    fn replace(&mut self, ids: Vec<ItemId>) {
        let mut snapshot = Vec::with_capacity(ids.len());
        for id in ids {
            if !snapshot.contains(&id) {
                snapshot.push(id);
            }
        }
        self.snapshot = snapshot;
        self.overlays.clear();
        self.synced_at = Some(Utc::now());
    }

    fn entries(&self) -> Vec<MembershipEntry> {
        let mut entries: Vec<MembershipEntry> = self
            .snapshot
            .iter()
            .filter(|id| self.contains(**id))
            .map(|&id| MembershipEntry {
                id,
                optimistic: false,
            })
            .collect();

        let mut added: Vec<(u64, ItemId)> = self
            .overlays
            .iter()
            .filter(|(id, overlay)| overlay.present && !self.snapshot.contains(id))
            .map(|(&id, overlay)| (overlay.seq, id))
            .collect();
        added.sort_unstable();
        entries.extend(added.into_iter().map(|(_, id)| MembershipEntry {
            id,
            optimistic: true,
        }));
        entries
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Optimistic favorites list reconciled against the server.
///
/// Every toggle is applied locally at once, sent to the server as the desired
/// end state, then followed by a full re-fetch that replaces local state.
/// Concurrent toggles race: whichever re-fetch settles last wins.
pub struct ToggleReconciler {
    client: ApiClient,
    endpoints: FavoritesEndpoints,
    owner: Option<Arc<SessionManager>>,
    ledger: Mutex<Ledger>,
}

impl ToggleReconciler {
    pub fn new(client: ApiClient, endpoints: FavoritesEndpoints) -> Self {
        Self {
            client,
            endpoints,
            owner: None,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Scope the list to the user the session's credential belongs to.
    pub fn with_owner(mut self, session: Arc<SessionManager>) -> Self {
        self.owner = Some(session);
        self
    }

    fn owner_id(&self) -> Option<u64> {
        self.owner.as_ref()?.credential()?.user_id()
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ===== Reads =====

    pub fn is_favorite(&self, id: impl ToItemId) -> bool {
        id.to_item_id()
            .map(|id| self.lock().contains(id))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<MembershipEntry> {
        self.lock().entries()
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.list().into_iter().map(|entry| entry.id).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().overlays.is_empty()
    }

    /// When the list was last replaced by a server snapshot
    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.lock().synced_at
    }

    // ===== Network =====

    /// Replace local state with the server's list.
    pub async fn refresh(&self) -> ApiResult<Vec<MembershipEntry>> {
        let path = self.endpoints.list_path(self.owner_id());
        let list: FavoriteList = self.client.get_json(&path).await?;
        let ids = list.into_ids();
        debug!(count = ids.len(), "Favorites synced");

        let mut ledger = self.lock();
        ledger.replace(ids);
        Ok(ledger.entries())
    }

    /// Flip membership of `id`. Returns the membership the server reports
    /// afterwards.
    pub async fn toggle(&self, id: impl ToItemId) -> ApiResult<bool> {
        let id = id.to_item_id().ok_or(ApiError::InvalidItemId)?;

        let (desired, seq) = {
            let mut ledger = self.lock();
            let desired = !ledger.contains(id);
            (desired, ledger.overlay(id, desired))
        };
        debug!(%id, desired, "Applied optimistic toggle");

        let mutation = self.mutate(id, desired).await;
        if let Err(ref e) = mutation {
            warn!(%id, error = %e, "Favorite mutation failed");
            self.lock().revert(id, seq);
        }

        let resync = self.refresh().await;
        mutation?;
        resync?;

        let actual = self.is_favorite(id);
        if actual != desired {
            debug!(%id, desired, actual, "Server state differs from optimistic toggle");
        }
        Ok(actual)
    }

    async fn mutate(&self, id: ItemId, desired: bool) -> ApiResult<()> {
        let path = self.endpoints.toggle.as_str();
        let request = match self.endpoints.style {
            MutationStyle::DesiredState => ApiRequest::post(path).json(&ToggleBody {
                item_id: id,
                desired_state: Some(desired),
            })?,
            MutationStyle::AddRemove => {
                let body = ToggleBody {
                    item_id: id,
                    desired_state: None,
                };
                if desired {
                    ApiRequest::post(path).json(&body)?
                } else {
                    ApiRequest::delete(path).json(&body)?
                }
            }
        };
        self.client.send(request).await?;
        Ok(())
    }
}
