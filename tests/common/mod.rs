#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use allocation_workbench::{
    clients::{
        AllocationApi, AllocationSolver, DistributionEnsurer, ItemSource, PersistedAllocation,
        SuggestionService,
    },
    config::AppConfig,
    errors::ServiceError,
    models::{
        AllocationChange, AllocationProposal, AllocationState, AllocationTableItem, Distribution,
        ItemPage, LineItem, Partner, PartnerRequest, Program, SuggestionResponse, TableFilters,
    },
    AppState, Collaborators,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use serde_json::Value;
use tokio::sync::Notify;
use tower::ServiceExt;

pub const PARTNER_A: i64 = 10;
pub const PARTNER_B: i64 = 20;

pub fn partner_a() -> Partner {
    Partner::new(PARTNER_A, "North Pantry")
}

pub fn partner_b() -> Partner {
    Partner::new(PARTNER_B, "South Shelter")
}

pub fn line_item(id: i64, quantity: u32, allocation: AllocationState) -> LineItem {
    LineItem {
        id,
        quantity,
        lot: Some(format!("LOT-{}", id)),
        pallet: None,
        box_number: None,
        allocation,
    }
}

pub fn request(id: i64, partner: Partner, quantity: u32) -> PartnerRequest {
    PartnerRequest {
        id,
        partner_id: partner.id,
        partner,
        quantity,
        items_allocated: 0,
    }
}

/// General item 1: line item 11 unallocated, line item 12 allocated to
/// partner A; A requested 5 and B requested 2. Counters are left at zero.
///
/// General item 2: line item 21 allocated to partner B.
pub fn fixture_items() -> Vec<AllocationTableItem> {
    vec![
        AllocationTableItem {
            id: 1,
            title: "Canned Soup".into(),
            item_type: "Food".into(),
            quantity: 2,
            unit_type: "case".into(),
            quantity_per_unit: 12,
            requests: vec![request(1, partner_a(), 5), request(2, partner_b(), 2)],
            items: vec![
                line_item(11, 1, AllocationState::Unallocated),
                line_item(
                    12,
                    1,
                    AllocationState::Persisted {
                        id: 900,
                        partner: partner_a(),
                    },
                ),
            ],
        },
        AllocationTableItem {
            id: 2,
            title: "Blankets".into(),
            item_type: "Household".into(),
            quantity: 4,
            unit_type: "bale".into(),
            quantity_per_unit: 1,
            requests: vec![request(3, partner_b(), 4)],
            items: vec![line_item(
                21,
                4,
                AllocationState::Persisted {
                    id: 901,
                    partner: partner_b(),
                },
            )],
        },
    ]
}

pub fn program(name: &str) -> Program {
    Program(serde_json::json!({ "name": name }))
}

/// In-memory stand-in for every upstream collaborator.
pub struct FakeUpstream {
    pub page: Mutex<ItemPage>,
    pub programs: Mutex<Vec<Program>>,
    pub proposals: Mutex<Vec<AllocationProposal>>,
    pub suggest_error: Mutex<Option<String>>,
    pub apply_error: Mutex<Option<String>>,
    pub apply_limit: Mutex<Option<usize>>,
    pub allocate_error: Mutex<Option<String>>,
    pub fetch_error: Mutex<Option<String>>,
    pub applied: Mutex<Vec<Vec<AllocationChange>>>,
    pub fetches: Mutex<Vec<(u64, u64, TableFilters)>>,
    pub created: Mutex<Vec<(Option<i64>, i64, i64)>>,
    pub deleted: Mutex<Vec<i64>>,
    pub suggest_calls: AtomicUsize,
    pub solve_calls: AtomicUsize,
    pub next_allocation_id: AtomicI64,
    /// Signalled when a suggest call starts.
    pub suggest_started: Notify,
    /// When set, suggest waits on it before answering.
    pub suggest_gate: Mutex<Option<Arc<Notify>>>,
    /// Signalled when an apply call starts.
    pub apply_started: Notify,
    /// When set, apply waits on it before answering.
    pub apply_gate: Mutex<Option<Arc<Notify>>>,
}

impl Default for FakeUpstream {
    fn default() -> Self {
        let items = fixture_items();
        Self {
            page: Mutex::new(ItemPage {
                total: items.len() as u64,
                data: items,
            }),
            programs: Mutex::new(Vec::new()),
            proposals: Mutex::new(Vec::new()),
            suggest_error: Mutex::new(None),
            apply_error: Mutex::new(None),
            apply_limit: Mutex::new(None),
            allocate_error: Mutex::new(None),
            fetch_error: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            suggest_calls: AtomicUsize::new(0),
            solve_calls: AtomicUsize::new(0),
            next_allocation_id: AtomicI64::new(5000),
            suggest_started: Notify::new(),
            suggest_gate: Mutex::new(None),
            apply_started: Notify::new(),
            apply_gate: Mutex::new(None),
        }
    }
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Suggest answers with one program which solves to `proposals`.
    pub fn suggesting(&self, proposals: Vec<AllocationProposal>) {
        *self.programs.lock().unwrap() = vec![program("balance")];
        *self.proposals.lock().unwrap() = proposals;
    }

    pub fn hold_suggestions(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.suggest_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn hold_applies(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.apply_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release_applies(&self) {
        *self.apply_gate.lock().unwrap() = None;
    }

    pub fn applied_batches(&self) -> Vec<Vec<AllocationChange>> {
        self.applied.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            source: self.clone(),
            suggester: self.clone(),
            solver: self.clone(),
            allocations: self.clone(),
            distributions: self.clone(),
        }
    }
}

fn upstream_error(message: &Option<String>) -> Result<(), ServiceError> {
    match message {
        Some(message) => Err(ServiceError::ExternalServiceError(message.clone())),
        None => Ok(()),
    }
}

#[async_trait]
impl ItemSource for FakeUpstream {
    async fn fetch(
        &self,
        page_size: u64,
        page: u64,
        filters: &TableFilters,
    ) -> Result<ItemPage, ServiceError> {
        self.fetches
            .lock()
            .unwrap()
            .push((page_size, page, filters.clone()));
        upstream_error(&self.fetch_error.lock().unwrap())?;
        Ok(self.page.lock().unwrap().clone())
    }
}

#[async_trait]
impl SuggestionService for FakeUpstream {
    async fn suggest(
        &self,
        _items: &[AllocationTableItem],
    ) -> Result<SuggestionResponse, ServiceError> {
        self.suggest_calls.fetch_add(1, Ordering::SeqCst);
        self.suggest_started.notify_one();

        let gate = self.suggest_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        upstream_error(&self.suggest_error.lock().unwrap())?;
        Ok(SuggestionResponse {
            programs: self.programs.lock().unwrap().clone(),
        })
    }

    async fn apply(&self, changes: &[AllocationChange]) -> Result<usize, ServiceError> {
        self.applied.lock().unwrap().push(changes.to_vec());
        self.apply_started.notify_one();

        let gate = self.apply_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        upstream_error(&self.apply_error.lock().unwrap())?;
        let limit = *self.apply_limit.lock().unwrap();
        Ok(limit.map_or(changes.len(), |limit| limit.min(changes.len())))
    }
}

#[async_trait]
impl AllocationSolver for FakeUpstream {
    async fn solve(&self, _programs: &[Program]) -> Result<Vec<AllocationProposal>, ServiceError> {
        self.solve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.proposals.lock().unwrap().clone())
    }
}

#[async_trait]
impl AllocationApi for FakeUpstream {
    async fn create_allocation(
        &self,
        partner: &Partner,
        line_item_id: i64,
    ) -> Result<PersistedAllocation, ServiceError> {
        upstream_error(&self.allocate_error.lock().unwrap())?;
        self.created
            .lock()
            .unwrap()
            .push((None, partner.id, line_item_id));
        Ok(PersistedAllocation {
            id: self.next_allocation_id.fetch_add(1, Ordering::SeqCst),
            partner: partner.clone(),
        })
    }

    async fn create_distribution_allocation(
        &self,
        distribution_id: i64,
        partner: &Partner,
        line_item_id: i64,
    ) -> Result<PersistedAllocation, ServiceError> {
        upstream_error(&self.allocate_error.lock().unwrap())?;
        self.created
            .lock()
            .unwrap()
            .push((Some(distribution_id), partner.id, line_item_id));
        Ok(PersistedAllocation {
            id: self.next_allocation_id.fetch_add(1, Ordering::SeqCst),
            partner: partner.clone(),
        })
    }

    async fn delete_allocation(&self, allocation_id: i64) -> Result<(), ServiceError> {
        upstream_error(&self.allocate_error.lock().unwrap())?;
        self.deleted.lock().unwrap().push(allocation_id);
        Ok(())
    }
}

#[async_trait]
impl DistributionEnsurer for FakeUpstream {
    async fn ensure_distribution_for_partner(
        &self,
        partner_id: i64,
        partner_name: &str,
    ) -> Result<Distribution, ServiceError> {
        Ok(Distribution {
            id: 700 + partner_id,
            partner_id,
            partner_name: partner_name.to_string(),
            pending: true,
        })
    }
}

pub fn test_config() -> AppConfig {
    AppConfig::new(
        "127.0.0.1".to_string(),
        18_080,
        "http://upstream.test".to_string(),
        "test".to_string(),
    )
}

/// Router harness backed by a [`FakeUpstream`].
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub upstream: Arc<FakeUpstream>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let upstream = FakeUpstream::new();
        let state = AppState::new(config, upstream.collaborators());
        let router = allocation_workbench::app_router(state.clone());
        Self {
            router,
            state,
            upstream,
        }
    }

    /// Send a request and decode the JSON body.
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (u16, Value) {
        let mut builder = Request::builder().method(method).uri(uri);

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");

        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read response body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("response body is not json")
        };
        (status, value)
    }

    pub async fn post(&self, uri: &str, body: Value) -> (u16, Value) {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn get(&self, uri: &str) -> (u16, Value) {
        self.request(Method::GET, uri, None).await
    }

    /// Loads the fixture page into the table.
    pub async fn load(&self) -> Value {
        let (status, body) = self.post("/api/v1/table/load", serde_json::json!({})).await;
        assert_eq!(status, 200, "load failed: {}", body);
        body
    }
}
