//! Store traits: the document store holding leads, flows and users.
//!
//! Implementations must apply every write as one atomic document update;
//! callers never read-modify-write through these traits.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CalendarConnection, Lead, LeadStatus, LeadUpdate, Node, OAuthTokens, Route};

/// Read-only view of flow graphs.
#[async_trait]
pub trait FlowGraphStore: Send + Sync {
    /// Node of a flow. `NotFound` when either the flow or the node is missing.
    async fn get_node(&self, flow_id: &str, node_id: &str) -> Result<Node>;

    /// All routing edges of a flow.
    async fn get_routes(&self, flow_id: &str) -> Result<Vec<Route>>;
}

/// Lead progress: status, current node and annotations.
#[async_trait]
pub trait LeadStateStore: Send + Sync {
    async fn get_lead(&self, lead_id: &str) -> Result<Lead>;

    async fn update_status_and_node(
        &self,
        lead_id: &str,
        status: LeadStatus,
        node_id: &str,
    ) -> Result<()>;

    async fn update_lead(&self, lead_id: &str, update: LeadUpdate) -> Result<()>;

    /// Apply `update` only while the lead still sits on `node_id`.
    /// `Ok(false)` when the lead has moved on; `NotFound` when it is gone.
    async fn update_lead_on_node(
        &self,
        lead_id: &str,
        node_id: &str,
        update: LeadUpdate,
    ) -> Result<bool>;
}

/// Users' calendar connections and their OAuth tokens.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_calendar_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<CalendarConnection>;

    async fn update_tokens(
        &self,
        user_id: &str,
        connection_id: &str,
        tokens: &OAuthTokens,
    ) -> Result<()>;
}
