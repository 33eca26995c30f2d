//! Per-line-item partner picker.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::reducer::TableCommand;
use crate::clients::{AllocationApi, DistributionEnsurer, PersistedAllocation};
use crate::errors::ServiceError;
use crate::models::{AllocationState, LineItem, Partner, PartnerRequest};
use crate::notifications::{Notifier, Toast};

/// What the user picked in a chip's dropdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "partner_id", rename_all = "snake_case")]
pub enum PartnerSelection {
    Partner(i64),
    Unallocate,
}

impl From<Option<i64>> for PartnerSelection {
    fn from(partner_id: Option<i64>) -> Self {
        partner_id.map_or(PartnerSelection::Unallocate, PartnerSelection::Partner)
    }
}

/// Everything a chip knows about the line item it controls.
#[derive(Debug, Clone, Copy)]
pub struct ChipContext<'a> {
    pub general_item_id: i64,
    pub line_item: &'a LineItem,
    pub requests: &'a [PartnerRequest],
    pub interaction_mode: bool,
}

/// Resolved intent of a selection after toggle handling.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChipAction {
    Allocate(Partner),
    Unallocate,
    Nothing,
}

/// Turns chip selections into table commands.
///
/// Outside interaction mode every change is persisted before a command is
/// returned; inside it nothing leaves the process.
#[derive(Clone)]
pub struct ChipController {
    api: Arc<dyn AllocationApi>,
    distributions: Option<Arc<dyn DistributionEnsurer>>,
    notifier: Arc<dyn Notifier>,
}

impl ChipController {
    pub fn new(api: Arc<dyn AllocationApi>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            api,
            distributions: None,
            notifier,
        }
    }

    /// Routes direct allocations through a per-partner distribution.
    pub fn with_distributions(mut self, ensurer: Arc<dyn DistributionEnsurer>) -> Self {
        self.distributions = Some(ensurer);
        self
    }

    /// Handles one selection. `Ok(None)` means nothing needs to change.
    ///
    /// Errors have already been reported through the notifier.
    #[instrument(skip(self, ctx), fields(
        general_item_id = ctx.general_item_id,
        line_item_id = ctx.line_item.id,
        interaction_mode = ctx.interaction_mode
    ))]
    pub async fn select(
        &self,
        ctx: ChipContext<'_>,
        selection: PartnerSelection,
    ) -> Result<Option<TableCommand>, ServiceError> {
        let action = match self.resolve(&ctx, selection) {
            Ok(action) => action,
            Err(err) => {
                self.notifier.notify(Toast::error(err.toast_message()));
                return Err(err);
            }
        };

        let allocation = match action {
            ChipAction::Nothing => return Ok(None),
            ChipAction::Allocate(partner) if ctx.interaction_mode => {
                AllocationState::Proposed { partner }
            }
            ChipAction::Unallocate if ctx.interaction_mode => AllocationState::Unallocated,
            ChipAction::Allocate(partner) => self.allocate(&ctx, partner).await?,
            ChipAction::Unallocate => self.unallocate(&ctx).await?,
        };

        Ok(Some(TableCommand::SetAllocation {
            general_item_id: ctx.general_item_id,
            line_item_id: ctx.line_item.id,
            allocation,
        }))
    }

    fn resolve(
        &self,
        ctx: &ChipContext<'_>,
        selection: PartnerSelection,
    ) -> Result<ChipAction, ServiceError> {
        let current = ctx.line_item.partner_id();
        match selection {
            // picking the current partner again toggles the allocation off
            PartnerSelection::Partner(partner_id) if current == Some(partner_id) => {
                Ok(ChipAction::Unallocate)
            }
            PartnerSelection::Partner(partner_id) => ctx
                .requests
                .iter()
                .find(|r| r.partner_id == partner_id)
                .map(|r| ChipAction::Allocate(Partner::new(partner_id, r.partner.name.clone())))
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Partner {} has not requested this item",
                        partner_id
                    ))
                }),
            PartnerSelection::Unallocate if current.is_none() => Ok(ChipAction::Nothing),
            PartnerSelection::Unallocate => Ok(ChipAction::Unallocate),
        }
    }

    async fn allocate(
        &self,
        ctx: &ChipContext<'_>,
        partner: Partner,
    ) -> Result<AllocationState, ServiceError> {
        let line_item_id = ctx.line_item.id;
        let result = match &self.distributions {
            Some(ensurer) => {
                match ensurer
                    .ensure_distribution_for_partner(partner.id, &partner.name)
                    .await
                {
                    Ok(distribution) => {
                        self.api
                            .create_distribution_allocation(distribution.id, &partner, line_item_id)
                            .await
                    }
                    Err(err) => Err(err),
                }
            }
            None => self.api.create_allocation(&partner, line_item_id).await,
        };

        match result {
            Ok(PersistedAllocation { id, partner }) => {
                metrics::counter!("workbench_chip_allocations_total", 1);
                info!(line_item_id, allocation_id = id, partner_id = partner.id, "line item allocated");
                self.notifier
                    .notify(Toast::success(format!("Allocated to {}", partner.name)));
                Ok(AllocationState::Persisted { id, partner })
            }
            Err(err) => {
                metrics::counter!("workbench_chip_failures_total", 1, "action" => "allocate");
                warn!(line_item_id, error = %err, "allocation failed");
                self.notifier.notify(Toast::error(format!(
                    "Failed to allocate: {}",
                    err.toast_message()
                )));
                Err(err)
            }
        }
    }

    async fn unallocate(&self, ctx: &ChipContext<'_>) -> Result<AllocationState, ServiceError> {
        let line_item_id = ctx.line_item.id;
        let Some(allocation_id) = ctx.line_item.allocation.persisted_id() else {
            // nothing stored yet, only the local marker goes away
            return Ok(AllocationState::Unallocated);
        };

        match self.api.delete_allocation(allocation_id).await {
            Ok(()) => {
                metrics::counter!("workbench_chip_unallocations_total", 1);
                info!(line_item_id, allocation_id, "line item unallocated");
                self.notifier.notify(Toast::success("Allocation removed"));
                Ok(AllocationState::Unallocated)
            }
            Err(err) => {
                metrics::counter!("workbench_chip_failures_total", 1, "action" => "unallocate");
                warn!(line_item_id, allocation_id, error = %err, "unallocation failed");
                self.notifier.notify(Toast::error(format!(
                    "Failed to remove allocation: {}",
                    err.toast_message()
                )));
                Err(err)
            }
        }
    }
}
