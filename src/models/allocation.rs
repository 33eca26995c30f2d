use serde::{Deserialize, Serialize};

/// An organization that can request and receive allocated inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partner {
    pub id: i64,
    pub name: String,
}

impl Partner {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Display label used when a partner id has no matching request.
    pub fn fallback(id: i64) -> Self {
        Self::new(id, format!("Partner {}", id))
    }
}

/// Allocation status of a single line item.
///
/// `Proposed` allocations exist only while the table is in interaction mode;
/// they have no backing record until the preview is kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllocationState {
    #[default]
    Unallocated,
    Persisted {
        id: i64,
        partner: Partner,
    },
    Proposed {
        partner: Partner,
    },
}

impl AllocationState {
    pub fn partner(&self) -> Option<&Partner> {
        match self {
            AllocationState::Unallocated => None,
            AllocationState::Persisted { partner, .. } | AllocationState::Proposed { partner } => {
                Some(partner)
            }
        }
    }

    pub fn partner_id(&self) -> Option<i64> {
        self.partner().map(|p| p.id)
    }

    /// Id of the stored allocation record, if one exists.
    pub fn persisted_id(&self) -> Option<i64> {
        match self {
            AllocationState::Persisted { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self, AllocationState::Unallocated)
    }

    pub fn is_proposed(&self) -> bool {
        matches!(self, AllocationState::Proposed { .. })
    }
}
