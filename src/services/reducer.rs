//! Single entry point for table mutations.
//!
//! Controls never edit the item list directly; they hand a [`TableCommand`]
//! to [`reduce`], which touches only the owning general item and keeps the
//! derived request counters in step.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::snapshot::recompute_partner_allocated;
use crate::models::{AllocationState, AllocationTableItem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableCommand {
    /// Replace one line item's allocation.
    SetAllocation {
        general_item_id: i64,
        line_item_id: i64,
        allocation: AllocationState,
    },
    /// Refresh one partner's counter within one general item.
    RecomputeItemsAllocated { general_item_id: i64, partner_id: i64 },
}

impl TableCommand {
    pub fn general_item_id(&self) -> i64 {
        match self {
            TableCommand::SetAllocation {
                general_item_id, ..
            }
            | TableCommand::RecomputeItemsAllocated {
                general_item_id, ..
            } => *general_item_id,
        }
    }
}

/// Applies `command` to `items`. Returns `false` when its target does not exist.
pub fn reduce(items: &mut [AllocationTableItem], command: TableCommand) -> bool {
    let general_item_id = command.general_item_id();
    let Some(item) = items.iter_mut().find(|item| item.id == general_item_id) else {
        debug!(general_item_id, "command targets an item that is not loaded");
        return false;
    };

    match command {
        TableCommand::SetAllocation {
            line_item_id,
            allocation,
            ..
        } => {
            let Some(line_item) = item.line_item_mut(line_item_id) else {
                debug!(general_item_id, line_item_id, "line item not found");
                return false;
            };
            let vacated = line_item.partner_id();
            let assigned = allocation.partner_id();
            line_item.allocation = allocation;

            for partner_id in [vacated, assigned].into_iter().flatten() {
                recompute_partner_allocated(item, partner_id);
            }
            true
        }
        TableCommand::RecomputeItemsAllocated { partner_id, .. } => {
            recompute_partner_allocated(item, partner_id);
            true
        }
    }
}
