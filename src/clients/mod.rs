//! Collaborators the allocation workflow depends on.
//!
//! Every external system is reached through one of these traits so the
//! table and chip logic can run against HTTP clients in production and
//! in-memory fakes in tests.

use async_trait::async_trait;

use crate::errors::ServiceError;
use crate::models::{
    AllocationChange, AllocationProposal, AllocationTableItem, Distribution, ItemPage, Partner,
    Program, SuggestionResponse, TableFilters,
};

pub mod http;

pub use http::{HttpClientConfig, UpstreamClient};

/// Paginated source of table items.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn fetch(
        &self,
        page_size: u64,
        page: u64,
        filters: &TableFilters,
    ) -> Result<ItemPage, ServiceError>;
}

/// Suggestion requests and commits of suggestion-driven changes.
#[async_trait]
pub trait SuggestionService: Send + Sync {
    /// Asks for optimization programs covering `items`.
    async fn suggest(&self, items: &[AllocationTableItem]) -> Result<SuggestionResponse, ServiceError>;

    /// Persists `changes`; returns how many were actually written.
    async fn apply(&self, changes: &[AllocationChange]) -> Result<usize, ServiceError>;
}

/// Turns opaque programs into concrete line item proposals.
#[async_trait]
pub trait AllocationSolver: Send + Sync {
    async fn solve(&self, programs: &[Program]) -> Result<Vec<AllocationProposal>, ServiceError>;
}

/// A stored allocation as returned by the allocation endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedAllocation {
    pub id: i64,
    pub partner: Partner,
}

/// Direct, immediately persisted allocation edits.
#[async_trait]
pub trait AllocationApi: Send + Sync {
    async fn create_allocation(
        &self,
        partner: &Partner,
        line_item_id: i64,
    ) -> Result<PersistedAllocation, ServiceError>;

    async fn create_distribution_allocation(
        &self,
        distribution_id: i64,
        partner: &Partner,
        line_item_id: i64,
    ) -> Result<PersistedAllocation, ServiceError>;

    async fn delete_allocation(&self, allocation_id: i64) -> Result<(), ServiceError>;
}

/// Lazily materializes the distribution a partner's allocations go into.
#[async_trait]
pub trait DistributionEnsurer: Send + Sync {
    async fn ensure_distribution_for_partner(
        &self,
        partner_id: i64,
        partner_name: &str,
    ) -> Result<Distribution, ServiceError>;
}
