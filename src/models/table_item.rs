use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::allocation::{AllocationState, Partner};

/// A concrete allocatable batch of a general item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: i64,
    pub quantity: u32,
    #[serde(default)]
    pub lot: Option<String>,
    #[serde(default)]
    pub pallet: Option<String>,
    #[serde(default)]
    pub box_number: Option<String>,
    #[serde(default)]
    pub allocation: AllocationState,
}

impl LineItem {
    pub fn partner_id(&self) -> Option<i64> {
        self.allocation.partner_id()
    }
}

/// A partner's outstanding ask against a general item.
///
/// `items_allocated` is a cached sum, recomputed after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerRequest {
    pub id: i64,
    pub partner_id: i64,
    pub partner: Partner,
    pub quantity: u32,
    #[serde(default)]
    pub items_allocated: u64,
}

/// A general item with its partner requests and line items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationTableItem {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub item_type: String,
    pub quantity: u32,
    #[serde(default)]
    pub unit_type: String,
    #[serde(default = "default_quantity_per_unit")]
    pub quantity_per_unit: u32,
    #[serde(default)]
    pub requests: Vec<PartnerRequest>,
    #[serde(default)]
    pub items: Vec<LineItem>,
}

fn default_quantity_per_unit() -> u32 {
    1
}

impl AllocationTableItem {
    pub fn line_item(&self, line_item_id: i64) -> Option<&LineItem> {
        self.items.iter().find(|li| li.id == line_item_id)
    }

    pub fn line_item_mut(&mut self, line_item_id: i64) -> Option<&mut LineItem> {
        self.items.iter_mut().find(|li| li.id == line_item_id)
    }

    pub fn request_for(&self, partner_id: i64) -> Option<&PartnerRequest> {
        self.requests.iter().find(|r| r.partner_id == partner_id)
    }

    /// Sum of quantities of line items currently allocated to `partner_id`.
    pub fn allocated_to(&self, partner_id: i64) -> u64 {
        self.items
            .iter()
            .filter(|li| li.partner_id() == Some(partner_id))
            .map(|li| u64::from(li.quantity))
            .sum()
    }
}

/// Free-form table filters, forwarded to the item source as query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableFilters(pub BTreeMap<String, String>);

impl TableFilters {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One page of table items as returned by the item source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPage {
    pub data: Vec<AllocationTableItem>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_item(id: i64, quantity: u32, allocation: AllocationState) -> LineItem {
        LineItem {
            id,
            quantity,
            lot: None,
            pallet: None,
            box_number: None,
            allocation,
        }
    }

    #[test]
    fn allocated_to_sums_only_matching_partner() {
        let a = Partner::new(1, "A");
        let b = Partner::new(2, "B");
        let item = AllocationTableItem {
            id: 10,
            title: "Gloves".into(),
            item_type: "PPE".into(),
            quantity: 9,
            unit_type: "box".into(),
            quantity_per_unit: 1,
            requests: vec![],
            items: vec![
                line_item(1, 2, AllocationState::Persisted { id: 5, partner: a.clone() }),
                line_item(2, 3, AllocationState::Proposed { partner: a }),
                line_item(3, 4, AllocationState::Persisted { id: 6, partner: b }),
                line_item(4, 8, AllocationState::Unallocated),
            ],
        };

        assert_eq!(item.allocated_to(1), 5);
        assert_eq!(item.allocated_to(2), 4);
        assert_eq!(item.allocated_to(3), 0);
    }

    #[test]
    fn filters_deserialize_from_plain_map() {
        let filters: TableFilters =
            serde_json::from_str(r#"{"category":"food","donor":"acme"}"#).unwrap();
        assert_eq!(
            filters,
            TableFilters::default().with("category", "food").with("donor", "acme")
        );
    }
}
