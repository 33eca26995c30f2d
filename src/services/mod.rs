//! Allocation workflow services.

pub mod chip;
pub mod reducer;
pub mod snapshot;
pub mod table;

pub use chip::{ChipContext, ChipController, PartnerSelection};
pub use reducer::{reduce, TableCommand};
pub use table::{
    AllocationTable, KeepOutcome, KeepStart, KeepTicket, ProcessingStage, SuggestOutcome,
    SuggestTicket, TablePhase, TableView,
};
