//! Allocation table session.
//!
//! Owns the authoritative item list and the pre-interaction snapshot, and
//! drives the interaction-mode state machine:
//!
//! ```text
//! Idle --begin_suggest--> Processing(Generating) --finish_suggest--> Previewing
//!   ^                            |  (empty / error / undo)               |
//!   +----------------------------+<------------- undo -------------------+
//!   +<------------------ keep: Processing(Saving) <----------------------+
//! ```
//!
//! Suggest is split into `begin_suggest` / `SuggestTicket::resolve` /
//! `finish_suggest` so callers sharing the table behind a lock can release
//! it while the collaborators run. A ticket whose generation no longer
//! matches (Undo, Cancel or a reload happened meanwhile) is discarded.
//! Keep follows the same shape with `begin_keep` / `KeepTicket::submit` /
//! `finish_keep`.
//!
//! The current phase is also published on a `watch` channel so readers such
//! as the health endpoint never wait on the table lock.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::chip::{ChipContext, ChipController, PartnerSelection};
use super::reducer::{reduce, TableCommand};
use super::snapshot::{
    build_preview_allocations, clone_allocation_items, collect_pending_changes, recompute_item,
    recompute_items_allocated,
};
use crate::clients::{AllocationSolver, ItemSource, SuggestionService};
use crate::errors::ServiceError;
use crate::models::{
    AllocationChange, AllocationProposal, AllocationSuggestion, AllocationTableItem, TableFilters,
};
use crate::notifications::{Notifier, Toast};

pub const GENERATING_MESSAGE: &str = "Generating allocation suggestions…";
pub const SAVING_MESSAGE: &str = "Saving allocation changes…";
pub const NO_SUGGESTIONS_MESSAGE: &str = "No allocation changes suggested";
pub const NOTHING_TO_SAVE_MESSAGE: &str = "No allocation changes to save";
pub const RELOAD_REQUIRED_MESSAGE: &str = "Reload the table before editing allocations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Generating,
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum TablePhase {
    Idle,
    Processing(ProcessingStage),
    Previewing,
}

/// Result of a suggestion cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SuggestOutcome {
    /// Guard rejected the request (no items, or not idle).
    Skipped,
    /// Nothing to change; table is back to idle.
    NoChanges,
    /// Preview applied; awaiting Undo or Keep.
    Previewing {
        suggestions: Vec<AllocationSuggestion>,
    },
    /// Suggestion or solving failed; snapshot restored.
    Failed { message: String },
    /// The session moved on before the result arrived; result dropped.
    Stale,
}

/// Result of a Keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum KeepOutcome {
    NotPreviewing,
    NothingToSave,
    Saved { submitted: usize, applied: usize },
    Failed { message: String },
    /// The table was reloaded while the save was running.
    Stale,
}

/// What `begin_keep` decided.
#[derive(Debug)]
pub enum KeepStart {
    /// Changes are ready to be submitted.
    Submit(KeepTicket),
    /// Nothing to submit; the outcome is final.
    Finished(KeepOutcome),
}

/// Changes captured when a Keep started.
#[derive(Debug, Clone)]
pub struct KeepTicket {
    generation: u64,
    changes: Vec<AllocationChange>,
}

impl KeepTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn changes(&self) -> &[AllocationChange] {
        &self.changes
    }

    #[instrument(skip_all, fields(generation = self.generation, change_count = self.changes.len()))]
    pub async fn submit(&self, suggester: &dyn SuggestionService) -> Result<usize, ServiceError> {
        suggester.apply(&self.changes).await
    }
}

/// Puts a table left in `Saving` back into preview if the save future is
/// dropped before it finishes.
struct SavingGuard<'a> {
    table: &'a mut AllocationTable,
    generation: u64,
    armed: bool,
}

impl SavingGuard<'_> {
    fn finish(mut self, ticket: KeepTicket, result: Result<usize, ServiceError>) -> KeepOutcome {
        self.armed = false;
        self.table.finish_keep(ticket, result)
    }
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.interrupt_keep(self.generation);
        }
    }
}

/// Proof that a suggestion cycle was started, carrying what it needs.
#[derive(Debug, Clone)]
pub struct SuggestTicket {
    generation: u64,
    items: Vec<AllocationTableItem>,
}

impl SuggestTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn items(&self) -> &[AllocationTableItem] {
        &self.items
    }

    /// Asks for programs and solves them. Zero programs skip the solver.
    #[instrument(skip_all, fields(generation = self.generation))]
    pub async fn resolve(
        &self,
        suggester: &dyn SuggestionService,
        solver: &dyn AllocationSolver,
    ) -> Result<Vec<AllocationProposal>, ServiceError> {
        let response = suggester.suggest(&self.items).await?;
        if response.programs.is_empty() {
            debug!("suggestion service returned no programs");
            return Ok(Vec::new());
        }
        solver.solve(&response.programs).await
    }
}

/// Serializable view of a table session.
#[derive(Debug, Clone, Serialize)]
pub struct TableView {
    pub phase: TablePhase,
    pub interaction_mode: bool,
    pub status_message: Option<String>,
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
    pub filters: TableFilters,
    pub needs_refresh: bool,
    pub items: Vec<AllocationTableItem>,
    pub suggestions: Vec<AllocationSuggestion>,
}

pub struct AllocationTable {
    items: Vec<AllocationTableItem>,
    total: u64,
    page: u64,
    page_size: u64,
    filters: TableFilters,
    pre_interaction_snapshot: Option<Vec<AllocationTableItem>>,
    phase: TablePhase,
    status_message: Option<String>,
    suggestions: Vec<AllocationSuggestion>,
    generation: u64,
    needs_refresh: bool,
    phase_tx: watch::Sender<TablePhase>,
    notifier: Arc<dyn Notifier>,
}

impl AllocationTable {
    pub fn new(notifier: Arc<dyn Notifier>, page_size: u64) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page: 1,
            page_size: page_size.max(1),
            filters: TableFilters::default(),
            pre_interaction_snapshot: None,
            phase: TablePhase::Idle,
            status_message: None,
            suggestions: Vec::new(),
            generation: 0,
            needs_refresh: false,
            phase_tx: watch::channel(TablePhase::Idle).0,
            notifier,
        }
    }

    /// Receiver that always holds the current phase.
    pub fn subscribe_phase(&self) -> watch::Receiver<TablePhase> {
        self.phase_tx.subscribe()
    }

    pub fn items(&self) -> &[AllocationTableItem] {
        &self.items
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn phase(&self) -> TablePhase {
        self.phase
    }

    pub fn is_interaction_mode(&self) -> bool {
        self.phase != TablePhase::Idle
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.phase, TablePhase::Processing(_))
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn suggestions(&self) -> &[AllocationSuggestion] {
        &self.suggestions
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    pub fn pre_interaction_snapshot(&self) -> Option<&[AllocationTableItem]> {
        self.pre_interaction_snapshot.as_deref()
    }

    pub fn view(&self) -> TableView {
        TableView {
            phase: self.phase,
            interaction_mode: self.is_interaction_mode(),
            status_message: self.status_message.clone(),
            page: self.page,
            page_size: self.page_size,
            total: self.total,
            filters: self.filters.clone(),
            needs_refresh: self.needs_refresh,
            items: self.items.clone(),
            suggestions: self.suggestions.clone(),
        }
    }

    /// Fetches one page and replaces the item list.
    ///
    /// A running interaction session is abandoned; on failure the current
    /// items stay as they are.
    #[instrument(skip(self, source, filters))]
    pub async fn load(
        &mut self,
        source: &dyn ItemSource,
        page: u64,
        page_size: u64,
        filters: TableFilters,
    ) -> Result<(), ServiceError> {
        let page = page.max(1);
        let page_size = page_size.max(1);

        match source.fetch(page_size, page, &filters).await {
            Ok(fetched) => {
                if self.is_interaction_mode() {
                    info!("reload abandons the current interaction session");
                }
                self.abandon_interaction();
                self.items = fetched.data;
                recompute_items_allocated(&mut self.items);
                self.total = fetched.total;
                self.page = page;
                self.page_size = page_size;
                self.filters = filters;
                self.needs_refresh = false;
                info!(item_count = self.items.len(), total = self.total, "table loaded");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to load table items");
                self.notifier.notify(Toast::error(format!(
                    "Failed to load items: {}",
                    err.toast_message()
                )));
                Err(err)
            }
        }
    }

    /// Reloads the current page with the current filters.
    pub async fn refresh(&mut self, source: &dyn ItemSource) -> Result<(), ServiceError> {
        let filters = self.filters.clone();
        self.load(source, self.page, self.page_size, filters).await
    }

    /// Replaces the item list outright, abandoning any interaction session.
    pub fn set_items(&mut self, mut items: Vec<AllocationTableItem>) {
        self.abandon_interaction();
        recompute_items_allocated(&mut items);
        self.total = items.len() as u64;
        self.needs_refresh = false;
        self.items = items;
    }

    /// Applies `updater` to one general item and refreshes its counters.
    pub fn update_item_by_id<F>(&mut self, general_item_id: i64, updater: F) -> bool
    where
        F: FnOnce(&mut AllocationTableItem),
    {
        match self.items.iter_mut().find(|item| item.id == general_item_id) {
            Some(item) => {
                updater(item);
                recompute_item(item);
                true
            }
            None => false,
        }
    }

    pub fn dispatch(&mut self, command: TableCommand) -> bool {
        reduce(&mut self.items, command)
    }

    /// Runs a chip selection against one line item and applies the result.
    ///
    /// Returns whether the table changed.
    pub async fn select_partner(
        &mut self,
        chip: &ChipController,
        general_item_id: i64,
        line_item_id: i64,
        selection: PartnerSelection,
    ) -> Result<bool, ServiceError> {
        if self.phase == TablePhase::Processing(ProcessingStage::Saving) {
            return Err(ServiceError::Conflict(
                "allocation changes are being saved".into(),
            ));
        }
        // kept suggestions are stored upstream but still look proposed here
        if self.needs_refresh {
            return Err(ServiceError::Conflict(RELOAD_REQUIRED_MESSAGE.into()));
        }
        let interaction_mode = self.is_interaction_mode();

        let command = {
            let item = self
                .items
                .iter()
                .find(|item| item.id == general_item_id)
                .ok_or_else(|| ServiceError::NotFound(format!("item {}", general_item_id)))?;
            let line_item = item
                .line_item(line_item_id)
                .ok_or_else(|| ServiceError::NotFound(format!("line item {}", line_item_id)))?;
            let ctx = ChipContext {
                general_item_id,
                line_item,
                requests: &item.requests,
                interaction_mode,
            };
            chip.select(ctx, selection).await?
        };

        Ok(command.map(|c| self.dispatch(c)).unwrap_or(false))
    }

    /// Starts a suggestion cycle. `None` when the guard rejects it.
    pub fn begin_suggest(&mut self) -> Option<SuggestTicket> {
        if self.items.is_empty() {
            debug!("suggest ignored: no items loaded");
            return None;
        }
        if self.phase != TablePhase::Idle {
            debug!(phase = ?self.phase, "suggest ignored: session busy");
            return None;
        }

        self.pre_interaction_snapshot = Some(clone_allocation_items(&self.items));
        self.set_phase(TablePhase::Processing(ProcessingStage::Generating));
        self.status_message = Some(GENERATING_MESSAGE.to_string());
        self.suggestions.clear();
        self.generation += 1;

        info!(generation = self.generation, "suggestion cycle started");
        Some(SuggestTicket {
            generation: self.generation,
            items: clone_allocation_items(&self.items),
        })
    }

    /// Completes a suggestion cycle with the collaborators' result.
    #[instrument(skip(self, ticket, result), fields(generation = ticket.generation))]
    pub fn finish_suggest(
        &mut self,
        ticket: SuggestTicket,
        result: Result<Vec<AllocationProposal>, ServiceError>,
    ) -> SuggestOutcome {
        if ticket.generation != self.generation
            || self.phase != TablePhase::Processing(ProcessingStage::Generating)
        {
            info!(current = self.generation, "discarding stale suggestion result");
            return SuggestOutcome::Stale;
        }
        let Some(snapshot) = self.pre_interaction_snapshot.take() else {
            return SuggestOutcome::Stale;
        };

        let proposals = match result {
            Ok(proposals) => proposals,
            Err(err) => {
                warn!(error = %err, "suggestion cycle failed");
                metrics::counter!("workbench_suggestion_failures_total", 1);
                self.items = snapshot;
                self.end_interaction();
                let message = format!(
                    "Failed to generate allocation suggestions: {}",
                    err.toast_message()
                );
                self.notifier.notify(Toast::error(message.clone()));
                return SuggestOutcome::Failed { message };
            }
        };

        let preview = build_preview_allocations(&snapshot, &proposals);
        if preview.suggestions.is_empty() {
            let mut restored = snapshot;
            recompute_items_allocated(&mut restored);
            self.items = restored;
            self.end_interaction();
            self.notifier.notify(Toast::info(NO_SUGGESTIONS_MESSAGE));
            return SuggestOutcome::NoChanges;
        }

        let count = preview.suggestions.len();
        metrics::counter!("workbench_suggestions_previewed_total", count as u64);
        info!(suggestion_count = count, "previewing suggested allocations");

        self.items = preview.items;
        self.pre_interaction_snapshot = Some(snapshot);
        self.set_phase(TablePhase::Previewing);
        self.status_message = Some(format!("{} suggested change(s) ready for review", count));
        self.suggestions = preview.suggestions.clone();
        self.notifier.notify(Toast::info(format!(
            "{} allocation change(s) suggested",
            count
        )));

        SuggestOutcome::Previewing {
            suggestions: preview.suggestions,
        }
    }

    /// Full suggestion cycle for callers that own the table exclusively.
    pub async fn suggest(
        &mut self,
        suggester: &dyn SuggestionService,
        solver: &dyn AllocationSolver,
    ) -> SuggestOutcome {
        let Some(ticket) = self.begin_suggest() else {
            return SuggestOutcome::Skipped;
        };
        let result = ticket.resolve(suggester, solver).await;
        self.finish_suggest(ticket, result)
    }

    /// Restores the pre-interaction snapshot. Valid while previewing or
    /// while suggestions are being generated.
    pub fn undo(&mut self) -> bool {
        match self.phase {
            TablePhase::Previewing | TablePhase::Processing(ProcessingStage::Generating) => {}
            _ => return false,
        }
        if let Some(snapshot) = self.pre_interaction_snapshot.take() {
            self.items = snapshot;
        }
        self.generation += 1;
        self.end_interaction();
        info!("interaction session undone");
        true
    }

    /// Abandons a pending suggestion request. Its result is dropped on arrival.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.undo();
        if cancelled {
            self.notifier.notify(Toast::info("Suggestion request cancelled"));
        }
        cancelled
    }

    /// Diff between the pre-interaction snapshot and the current items.
    pub fn pending_changes(&self) -> Vec<AllocationChange> {
        self.pre_interaction_snapshot
            .as_deref()
            .map(|snapshot| collect_pending_changes(snapshot, &self.items))
            .unwrap_or_default()
    }

    /// Persists the previewed changes.
    ///
    /// On success the session ends and the table is flagged for a reload so
    /// proposed allocations are replaced by stored ones. On failure the
    /// preview and its snapshot are kept so the user can retry or undo.
    /// Dropping the returned future mid-save puts the table back into
    /// preview.
    #[instrument(skip(self, suggester))]
    pub async fn keep(&mut self, suggester: &dyn SuggestionService) -> KeepOutcome {
        let ticket = match self.begin_keep() {
            KeepStart::Submit(ticket) => ticket,
            KeepStart::Finished(outcome) => return outcome,
        };
        let guard = SavingGuard {
            generation: ticket.generation,
            table: self,
            armed: true,
        };
        let result = ticket.submit(suggester).await;
        guard.finish(ticket, result)
    }

    /// Moves a preview into `Saving` and captures the changes to submit.
    pub fn begin_keep(&mut self) -> KeepStart {
        if self.phase != TablePhase::Previewing {
            return KeepStart::Finished(KeepOutcome::NotPreviewing);
        }

        let changes = self.pending_changes();
        if changes.is_empty() {
            self.end_interaction();
            self.notifier.notify(Toast::info(NOTHING_TO_SAVE_MESSAGE));
            return KeepStart::Finished(KeepOutcome::NothingToSave);
        }

        self.set_phase(TablePhase::Processing(ProcessingStage::Saving));
        self.status_message = Some(SAVING_MESSAGE.to_string());
        self.generation += 1;
        info!(generation = self.generation, change_count = changes.len(), "saving allocation changes");

        KeepStart::Submit(KeepTicket {
            generation: self.generation,
            changes,
        })
    }

    /// Completes a Keep with the result of submitting its changes.
    #[instrument(skip(self, ticket, result), fields(generation = ticket.generation))]
    pub fn finish_keep(
        &mut self,
        ticket: KeepTicket,
        result: Result<usize, ServiceError>,
    ) -> KeepOutcome {
        let submitted = ticket.changes.len();

        if ticket.generation != self.generation
            || self.phase != TablePhase::Processing(ProcessingStage::Saving)
        {
            info!(current = self.generation, "save finished after the table moved on");
            if result.is_ok() {
                self.needs_refresh = true;
            }
            return KeepOutcome::Stale;
        }

        match result {
            Ok(applied) => {
                metrics::counter!("workbench_changes_applied_total", applied as u64);
                self.end_interaction();
                self.needs_refresh = true;
                if applied >= submitted {
                    self.notifier.notify(Toast::success(format!(
                        "Saved {} allocation change(s)",
                        applied
                    )));
                } else {
                    warn!(submitted, applied, "partial apply");
                    self.notifier.notify(Toast::warning(format!(
                        "Saved {} of {} allocation changes",
                        applied, submitted
                    )));
                }
                info!(submitted, applied, "allocation changes kept");
                KeepOutcome::Saved { submitted, applied }
            }
            Err(err) => {
                warn!(error = %err, submitted, "failed to save allocation changes");
                self.set_phase(TablePhase::Previewing);
                self.status_message = Some(format!("{} change(s) not saved", submitted));
                let message = format!(
                    "Failed to save allocation changes: {}",
                    err.toast_message()
                );
                self.notifier.notify(Toast::error(message.clone()));
                KeepOutcome::Failed { message }
            }
        }
    }

    /// Returns an abandoned save to preview. Whether the upstream wrote the
    /// changes is unknown, so the table is also flagged for a reload.
    fn interrupt_keep(&mut self, generation: u64) {
        if generation != self.generation
            || self.phase != TablePhase::Processing(ProcessingStage::Saving)
        {
            return;
        }
        warn!(generation, "save interrupted before it finished");
        self.set_phase(TablePhase::Previewing);
        self.status_message = Some("Save interrupted; reload to see what was stored".to_string());
        self.needs_refresh = true;
        self.notifier.notify(Toast::warning(
            "Saving was interrupted; some changes may not have been stored",
        ));
    }

    fn set_phase(&mut self, phase: TablePhase) {
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn end_interaction(&mut self) {
        self.pre_interaction_snapshot = None;
        self.set_phase(TablePhase::Idle);
        self.status_message = None;
        self.suggestions.clear();
    }

    fn abandon_interaction(&mut self) {
        if self.is_interaction_mode() {
            self.generation += 1;
        }
        self.end_interaction();
    }
}
