//! Allocation snapshot utilities.
//!
//! Pure helpers over table item lists: deep copies for rollback, the derived
//! `items_allocated` counters, preview overlays built from solver proposals,
//! and the diff that Keep submits.

use std::collections::HashMap;

use crate::models::{
    AllocationChange, AllocationProposal, AllocationState, AllocationSuggestion,
    AllocationTableItem, Partner, PreviewAllocations,
};

/// Deep-copies an item list. The result shares nothing with `items`.
pub fn clone_allocation_items(items: &[AllocationTableItem]) -> Vec<AllocationTableItem> {
    items.to_vec()
}

/// Recomputes every request's `items_allocated` from the line items of its
/// own general item.
pub fn recompute_items_allocated(items: &mut [AllocationTableItem]) {
    for item in items.iter_mut() {
        recompute_item(item);
    }
}

/// Recomputes all request counters of a single general item.
pub fn recompute_item(item: &mut AllocationTableItem) {
    let mut totals: HashMap<i64, u64> = HashMap::new();
    for line_item in &item.items {
        if let Some(partner_id) = line_item.partner_id() {
            *totals.entry(partner_id).or_default() += u64::from(line_item.quantity);
        }
    }
    for request in item.requests.iter_mut() {
        request.items_allocated = totals.get(&request.partner_id).copied().unwrap_or(0);
    }
}

/// Recomputes the counter of one partner's request within one general item.
pub fn recompute_partner_allocated(item: &mut AllocationTableItem, partner_id: i64) {
    let allocated = item.allocated_to(partner_id);
    for request in item
        .requests
        .iter_mut()
        .filter(|r| r.partner_id == partner_id)
    {
        request.items_allocated = allocated;
    }
}

/// Partner display names keyed by id, taken from every request in `items`.
pub fn partner_directory(items: &[AllocationTableItem]) -> HashMap<i64, Partner> {
    let mut directory = HashMap::new();
    for request in items.iter().flat_map(|item| item.requests.iter()) {
        directory
            .entry(request.partner_id)
            .or_insert_with(|| Partner::new(request.partner_id, request.partner.name.clone()));
    }
    directory
}

/// Overlays `proposals` onto a copy of `base`.
///
/// Proposals that target an unknown line item are ignored; proposals that
/// would leave a line item with the partner it already has are not reported
/// as suggestions. Counters of the returned items are recomputed.
pub fn build_preview_allocations(
    base: &[AllocationTableItem],
    proposals: &[AllocationProposal],
) -> PreviewAllocations {
    let directory = partner_directory(base);
    let mut items = clone_allocation_items(base);

    let mut positions: HashMap<i64, (usize, usize)> = HashMap::new();
    for (item_idx, item) in items.iter().enumerate() {
        for (line_idx, line_item) in item.items.iter().enumerate() {
            positions.entry(line_item.id).or_insert((item_idx, line_idx));
        }
    }

    let mut suggestions = Vec::new();
    for proposal in proposals {
        let Some(&(item_idx, line_idx)) = positions.get(&proposal.line_item_id) else {
            continue;
        };
        let general_item_id = items[item_idx].id;
        let line_item = &mut items[item_idx].items[line_idx];

        if line_item.partner_id() == proposal.partner_id {
            continue;
        }

        let previous_partner = line_item.allocation.partner().cloned();
        let next_partner = proposal.partner_id.map(|partner_id| {
            directory
                .get(&partner_id)
                .cloned()
                .unwrap_or_else(|| Partner::fallback(partner_id))
        });

        line_item.allocation = match &next_partner {
            Some(partner) => AllocationState::Proposed {
                partner: partner.clone(),
            },
            None => AllocationState::Unallocated,
        };

        suggestions.push(AllocationSuggestion {
            general_item_id,
            line_item_id: proposal.line_item_id,
            previous_partner,
            next_partner,
        });
    }

    recompute_items_allocated(&mut items);
    PreviewAllocations { items, suggestions }
}

/// Diffs the current state against the pre-interaction snapshot.
///
/// Only partner identity is compared; allocation ids are ignored because
/// proposed allocations carry none.
pub fn collect_pending_changes(
    snapshot: &[AllocationTableItem],
    current: &[AllocationTableItem],
) -> Vec<AllocationChange> {
    let baseline: HashMap<i64, &AllocationState> = snapshot
        .iter()
        .flat_map(|item| item.items.iter())
        .map(|line_item| (line_item.id, &line_item.allocation))
        .collect();

    let mut changes = Vec::new();
    for line_item in current.iter().flat_map(|item| item.items.iter()) {
        let before = baseline.get(&line_item.id).copied();
        let before_partner = before.and_then(|state| state.partner());
        let after_partner = line_item.allocation.partner();

        if before_partner.map(|p| p.id) == after_partner.map(|p| p.id) {
            continue;
        }

        changes.push(AllocationChange {
            line_item_id: line_item.id,
            previous_partner: before_partner.cloned(),
            next_partner: after_partner.cloned(),
            previous_allocation_id: before.and_then(|state| state.persisted_id()),
        });
    }
    changes
}
