use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

use super::{
    AllocationApi, AllocationSolver, DistributionEnsurer, ItemSource, PersistedAllocation,
    SuggestionService,
};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::models::{
    AllocationChange, AllocationProposal, AllocationState, AllocationTableItem, Distribution,
    ItemPage, LineItem, Partner, PartnerRequest, Program, SuggestionResponse, TableFilters,
};
use crate::tracing::with_timing;

const TABLE_PATH: &str = "/api/allocation-table";
const SUGGEST_PATH: &str = "/api/allocations/suggest";
const SOLVE_PATH: &str = "/api/allocations/solve";
const APPLY_PATH: &str = "/api/allocations/apply";
const ALLOCATIONS_PATH: &str = "/api/allocations";
const DISTRIBUTIONS_PATH: &str = "/api/distributions";

/// Connection settings for [`UpstreamClient`]
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl From<&AppConfig> for HttpClientConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_url: config.upstream_url.clone(),
            timeout: config.upstream_timeout(),
        }
    }
}

/// JSON-over-HTTP client for the distribution app's API.
///
/// Implements every collaborator trait; wire payloads are camelCase and
/// allocations travel as `{id, partner}` objects or `null`.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    async fn send(operation: &'static str, request: RequestBuilder) -> Result<Response, ServiceError> {
        let response = request.send().await.map_err(|e| {
            metrics::counter!("workbench_upstream_errors_total", 1, "operation" => operation);
            ServiceError::ExternalServiceError(format!("{} request failed: {}", operation, e))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        metrics::counter!("workbench_upstream_errors_total", 1, "operation" => operation);
        let body = response.text().await.unwrap_or_default();
        warn!(operation, status = status.as_u16(), body = %body, "upstream rejected request");
        Err(ServiceError::ExternalApiError(format!(
            "{} failed with status {}",
            operation,
            status.as_u16()
        )))
    }

    async fn send_json<T: DeserializeOwned>(
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, ServiceError> {
        let response = Self::send(operation, request).await?;
        response.json::<T>().await.map_err(|e| {
            ServiceError::ExternalApiError(format!("{} returned an unreadable body: {}", operation, e))
        })
    }
}

#[async_trait]
impl ItemSource for UpstreamClient {
    #[instrument(skip(self, filters))]
    async fn fetch(
        &self,
        page_size: u64,
        page: u64,
        filters: &TableFilters,
    ) -> Result<ItemPage, ServiceError> {
        let mut query: Vec<(String, String)> = vec![
            ("pageSize".to_string(), page_size.to_string()),
            ("page".to_string(), page.to_string()),
        ];
        query.extend(filters.iter().map(|(k, v)| (k.clone(), v.clone())));

        let request = self.request(Method::GET, TABLE_PATH).query(&query);
        let page: WireItemPage =
            with_timing("fetch_table_items", || Self::send_json("fetch_table_items", request)).await?;

        Ok(ItemPage {
            data: page.data.into_iter().map(AllocationTableItem::from).collect(),
            total: page.total,
        })
    }
}

#[async_trait]
impl SuggestionService for UpstreamClient {
    #[instrument(skip(self, items), fields(item_count = items.len()))]
    async fn suggest(&self, items: &[AllocationTableItem]) -> Result<SuggestionResponse, ServiceError> {
        let body = SuggestBody {
            items: items.iter().map(WireTableItem::from).collect(),
        };
        let request = self.request(Method::POST, SUGGEST_PATH).json(&body);
        with_timing("suggest_allocations", || Self::send_json("suggest_allocations", request)).await
    }

    #[instrument(skip(self, changes), fields(change_count = changes.len()))]
    async fn apply(&self, changes: &[AllocationChange]) -> Result<usize, ServiceError> {
        let request = self
            .request(Method::POST, APPLY_PATH)
            .json(&ApplyBody { changes });
        let response: ApplyResponse =
            with_timing("apply_allocations", || Self::send_json("apply_allocations", request)).await?;
        Ok(response.applied)
    }
}

#[async_trait]
impl AllocationSolver for UpstreamClient {
    #[instrument(skip(self, programs), fields(program_count = programs.len()))]
    async fn solve(&self, programs: &[Program]) -> Result<Vec<AllocationProposal>, ServiceError> {
        let request = self
            .request(Method::POST, SOLVE_PATH)
            .json(&SolveBody { programs });
        with_timing("solve_programs", || Self::send_json("solve_programs", request)).await
    }
}

#[async_trait]
impl AllocationApi for UpstreamClient {
    #[instrument(skip(self, partner), fields(partner_id = partner.id))]
    async fn create_allocation(
        &self,
        partner: &Partner,
        line_item_id: i64,
    ) -> Result<PersistedAllocation, ServiceError> {
        let request = self
            .request(Method::POST, ALLOCATIONS_PATH)
            .json(&AllocateBody {
                partner_id: partner.id,
                line_item: line_item_id,
            });
        let created: WireAllocation =
            with_timing("create_allocation", || Self::send_json("create_allocation", request)).await?;
        created.into_persisted("create_allocation", partner)
    }

    #[instrument(skip(self, partner), fields(partner_id = partner.id))]
    async fn create_distribution_allocation(
        &self,
        distribution_id: i64,
        partner: &Partner,
        line_item_id: i64,
    ) -> Result<PersistedAllocation, ServiceError> {
        let path = format!("{}/{}/allocations", DISTRIBUTIONS_PATH, distribution_id);
        let request = self.request(Method::POST, &path).json(&AllocateBody {
            partner_id: partner.id,
            line_item: line_item_id,
        });
        let created: WireAllocation = with_timing("create_distribution_allocation", || {
            Self::send_json("create_distribution_allocation", request)
        })
        .await?;
        created.into_persisted("create_distribution_allocation", partner)
    }

    #[instrument(skip(self))]
    async fn delete_allocation(&self, allocation_id: i64) -> Result<(), ServiceError> {
        let path = format!("{}/{}", ALLOCATIONS_PATH, allocation_id);
        let request = self.request(Method::DELETE, &path);
        with_timing("delete_allocation", || Self::send("delete_allocation", request)).await?;
        Ok(())
    }
}

#[async_trait]
impl DistributionEnsurer for UpstreamClient {
    #[instrument(skip(self))]
    async fn ensure_distribution_for_partner(
        &self,
        partner_id: i64,
        partner_name: &str,
    ) -> Result<Distribution, ServiceError> {
        let path = format!("{}/ensure", DISTRIBUTIONS_PATH);
        let request = self.request(Method::POST, &path).json(&EnsureDistributionBody {
            partner_id,
            partner_name,
        });
        with_timing("ensure_distribution", || Self::send_json("ensure_distribution", request)).await
    }
}

// Wire format

#[derive(Serialize)]
struct SuggestBody {
    items: Vec<WireTableItem>,
}

#[derive(Serialize)]
struct SolveBody<'a> {
    programs: &'a [Program],
}

#[derive(Serialize)]
struct ApplyBody<'a> {
    changes: &'a [AllocationChange],
}

#[derive(Deserialize)]
struct ApplyResponse {
    applied: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocateBody {
    partner_id: i64,
    line_item: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnsureDistributionBody<'a> {
    partner_id: i64,
    partner_name: &'a str,
}

#[derive(Deserialize)]
struct WireItemPage {
    #[serde(default)]
    data: Vec<WireTableItem>,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WirePartner {
    id: i64,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireAllocation {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    partner: Option<WirePartner>,
}

impl WireAllocation {
    /// A created allocation must carry its id; the partner falls back to the
    /// one that was requested.
    fn into_persisted(
        self,
        operation: &'static str,
        requested: &Partner,
    ) -> Result<PersistedAllocation, ServiceError> {
        let id = self.id.ok_or_else(|| {
            ServiceError::ExternalApiError(format!("{} returned no allocation id", operation))
        })?;
        Ok(PersistedAllocation {
            id,
            partner: self
                .partner
                .map(Partner::from)
                .unwrap_or_else(|| requested.clone()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLineItem {
    id: i64,
    quantity: u32,
    #[serde(default)]
    lot: Option<String>,
    #[serde(default)]
    pallet: Option<String>,
    #[serde(default, rename = "box")]
    box_number: Option<String>,
    #[serde(default)]
    allocation: Option<WireAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    id: i64,
    partner_id: i64,
    partner: WirePartner,
    quantity: u32,
    #[serde(default)]
    items_allocated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTableItem {
    id: i64,
    title: String,
    #[serde(default, rename = "type")]
    item_type: String,
    quantity: u32,
    #[serde(default)]
    unit_type: String,
    #[serde(default = "one")]
    quantity_per_unit: u32,
    #[serde(default)]
    requests: Vec<WireRequest>,
    #[serde(default)]
    items: Vec<WireLineItem>,
}

fn one() -> u32 {
    1
}

impl From<WirePartner> for Partner {
    fn from(p: WirePartner) -> Self {
        Partner::new(p.id, p.name)
    }
}

impl From<&Partner> for WirePartner {
    fn from(p: &Partner) -> Self {
        WirePartner {
            id: p.id,
            name: p.name.clone(),
        }
    }
}

fn allocation_from_wire(wire: Option<WireAllocation>) -> AllocationState {
    match wire {
        Some(WireAllocation {
            id: Some(id),
            partner: Some(partner),
        }) => AllocationState::Persisted {
            id,
            partner: partner.into(),
        },
        Some(WireAllocation {
            id: None,
            partner: Some(partner),
        }) => AllocationState::Proposed {
            partner: partner.into(),
        },
        _ => AllocationState::Unallocated,
    }
}

fn allocation_to_wire(state: &AllocationState) -> Option<WireAllocation> {
    match state {
        AllocationState::Unallocated => None,
        AllocationState::Persisted { id, partner } => Some(WireAllocation {
            id: Some(*id),
            partner: Some(partner.into()),
        }),
        AllocationState::Proposed { partner } => Some(WireAllocation {
            id: None,
            partner: Some(partner.into()),
        }),
    }
}

impl From<WireTableItem> for AllocationTableItem {
    fn from(w: WireTableItem) -> Self {
        AllocationTableItem {
            id: w.id,
            title: w.title,
            item_type: w.item_type,
            quantity: w.quantity,
            unit_type: w.unit_type,
            quantity_per_unit: w.quantity_per_unit,
            requests: w
                .requests
                .into_iter()
                .map(|r| PartnerRequest {
                    id: r.id,
                    partner_id: r.partner_id,
                    partner: r.partner.into(),
                    quantity: r.quantity,
                    items_allocated: r.items_allocated,
                })
                .collect(),
            items: w
                .items
                .into_iter()
                .map(|li| LineItem {
                    id: li.id,
                    quantity: li.quantity,
                    lot: li.lot,
                    pallet: li.pallet,
                    box_number: li.box_number,
                    allocation: allocation_from_wire(li.allocation),
                })
                .collect(),
        }
    }
}

impl From<&AllocationTableItem> for WireTableItem {
    fn from(item: &AllocationTableItem) -> Self {
        WireTableItem {
            id: item.id,
            title: item.title.clone(),
            item_type: item.item_type.clone(),
            quantity: item.quantity,
            unit_type: item.unit_type.clone(),
            quantity_per_unit: item.quantity_per_unit,
            requests: item
                .requests
                .iter()
                .map(|r| WireRequest {
                    id: r.id,
                    partner_id: r.partner_id,
                    partner: (&r.partner).into(),
                    quantity: r.quantity,
                    items_allocated: r.items_allocated,
                })
                .collect(),
            items: item
                .items
                .iter()
                .map(|li| WireLineItem {
                    id: li.id,
                    quantity: li.quantity,
                    lot: li.lot.clone(),
                    pallet: li.pallet.clone(),
                    box_number: li.box_number.clone(),
                    allocation: allocation_to_wire(&li.allocation),
                })
                .collect(),
        }
    }
}
