// Allocation domain models
pub mod allocation;
pub mod change;
pub mod table_item;

pub use allocation::{AllocationState, Partner};
pub use change::{
    AllocationChange, AllocationProposal, AllocationSuggestion, Distribution, PreviewAllocations,
    Program, SuggestionResponse,
};
pub use table_item::{AllocationTableItem, ItemPage, LineItem, PartnerRequest, TableFilters};
