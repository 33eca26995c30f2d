use serde::{Deserialize, Serialize};

use super::allocation::Partner;
use super::table_item::AllocationTableItem;

/// Opaque optimization input handed to the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program(pub serde_json::Value);

/// Response of the suggestion service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestionResponse {
    #[serde(default)]
    pub programs: Vec<Program>,
}

/// Concrete solver output: move a line item to a partner, or unallocate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationProposal {
    pub line_item_id: i64,
    pub partner_id: Option<i64>,
}

impl AllocationProposal {
    pub fn assign(line_item_id: i64, partner_id: i64) -> Self {
        Self {
            line_item_id,
            partner_id: Some(partner_id),
        }
    }

    pub fn unassign(line_item_id: i64) -> Self {
        Self {
            line_item_id,
            partner_id: None,
        }
    }
}

/// A proposal that changes a line item's partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSuggestion {
    pub general_item_id: i64,
    pub line_item_id: i64,
    pub previous_partner: Option<Partner>,
    pub next_partner: Option<Partner>,
}

/// Preview overlay built from a base snapshot and a proposal set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewAllocations {
    pub items: Vec<AllocationTableItem>,
    pub suggestions: Vec<AllocationSuggestion>,
}

/// Diff record between the pre-interaction snapshot and the current preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationChange {
    pub line_item_id: i64,
    pub previous_partner: Option<Partner>,
    pub next_partner: Option<Partner>,
    pub previous_allocation_id: Option<i64>,
}

/// Distribution container that direct allocations can be placed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub id: i64,
    pub partner_id: i64,
    pub partner_name: String,
    #[serde(default)]
    pub pending: bool,
}
