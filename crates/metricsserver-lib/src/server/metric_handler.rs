//! Metric history query handler
//!
//! Requests for applications owned by another node are answered with a
//! redirect carrying a `referer` parameter; requests that already carry a
//! referer are always answered locally.

use super::ApiError;
use crate::collector::MetricCollector;
use crate::models::{AppInstanceMetric, Order};
use crate::observability::MetricsServerMetrics;
use crate::shard;
use crate::store::StoreError;
use async_trait::async_trait;
use axum::extract::{OriginalUri, Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use url::{form_urlencoded, Url};

/// Route serving metric histories
pub const METRIC_HISTORIES_PATH: &str = "/v1/apps/:appid/metric_histories/:metrictype";

const PARAM_INSTANCE_INDEX: &str = "instanceindex";
const PARAM_START: &str = "start";
const PARAM_END: &str = "end";
const PARAM_ORDER: &str = "order";
const PARAM_REFERER: &str = "referer";

/// Source of metric histories for locally owned applications
#[async_trait]
pub trait MetricQuerier: Send + Sync {
    async fn query_metrics(
        &self,
        app_id: &str,
        instance_index: i32,
        name: &str,
        start: i64,
        end: i64,
        order: Order,
    ) -> Result<Vec<AppInstanceMetric>, StoreError>;
}

#[async_trait]
impl MetricQuerier for MetricCollector {
    async fn query_metrics(
        &self,
        app_id: &str,
        instance_index: i32,
        name: &str,
        start: i64,
        end: i64,
        order: Order,
    ) -> Result<Vec<AppInstanceMetric>, StoreError> {
        MetricCollector::query_metrics(self, app_id, instance_index, name, start, end, order)
            .await
    }
}

/// Shared state of the query router
pub struct QueryState {
    node_index: usize,
    node_addrs: Vec<String>,
    redirect_scheme: String,
    querier: Arc<dyn MetricQuerier>,
    metrics: MetricsServerMetrics,
}

impl QueryState {
    /// `node_addrs` holds the `host:port` query address of every node
    pub fn new(
        node_index: usize,
        node_addrs: Vec<String>,
        redirect_scheme: impl Into<String>,
        querier: Arc<dyn MetricQuerier>,
    ) -> Self {
        Self {
            node_index,
            node_addrs,
            redirect_scheme: redirect_scheme.into(),
            querier,
            metrics: MetricsServerMetrics::new(),
        }
    }

    fn self_addr(&self) -> &str {
        self.node_addrs
            .get(self.node_index)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Build the query router
pub fn query_router(state: Arc<QueryState>) -> Router {
    Router::new()
        .route(METRIC_HISTORIES_PATH, get(get_metric_histories))
        .with_state(state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryParams {
    instance_index: i32,
    start: i64,
    end: i64,
    order: Order,
    redirected: bool,
}

impl HistoryParams {
    fn parse(pairs: &[(String, String)]) -> Result<Self, ApiError> {
        let mut values: HashMap<&str, Vec<&str>> = HashMap::new();
        for (key, value) in pairs {
            values.entry(key.as_str()).or_default().push(value.as_str());
        }

        let instance_index = match single(
            &values,
            PARAM_INSTANCE_INDEX,
            "Incorrect instanceIndex parameter in query string",
        )? {
            None => -1,
            Some(raw) => {
                let index: i32 = raw
                    .parse()
                    .map_err(|_| ApiError::bad_request("Error parsing instanceIndex"))?;
                if index < 0 {
                    return Err(ApiError::bad_request(
                        "InstanceIndex must be greater than or equal to 0",
                    ));
                }
                index
            }
        };

        let start = match single(&values, PARAM_START, "Incorrect start parameter in query string")? {
            None => 0,
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request("Error parsing start time"))?,
        };

        let end = match single(&values, PARAM_END, "Incorrect end parameter in query string")? {
            None => -1,
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request("Error parsing end time"))?,
        };

        let order = match single(&values, PARAM_ORDER, "Incorrect order parameter in query string")? {
            None => Order::default(),
            Some(raw) => raw.parse().map_err(|_| {
                ApiError::bad_request(
                    "Incorrect order parameter in query string, the value can only be ASC or DESC",
                )
            })?,
        };

        let redirected = values
            .get(PARAM_REFERER)
            .is_some_and(|v| v.iter().any(|r| !r.is_empty()));

        Ok(Self {
            instance_index,
            start,
            end,
            order,
            redirected,
        })
    }
}

/// The value of a parameter that may appear at most once
fn single<'a>(
    values: &HashMap<&str, Vec<&'a str>>,
    key: &str,
    duplicate_message: &str,
) -> Result<Option<&'a str>, ApiError> {
    match values.get(key).map(Vec::as_slice) {
        None | Some([]) => Ok(None),
        Some([value]) => Ok(Some(*value)),
        Some(_) => Err(ApiError::bad_request(duplicate_message)),
    }
}

fn redirect_location(
    scheme: &str,
    owner_addr: &str,
    path: &str,
    pairs: &[(String, String)],
    referer: &str,
) -> Result<String, ApiError> {
    let mut url = Url::parse(&format!("{}://{}", scheme, owner_addr))
        .map_err(|e| ApiError::internal(format!("invalid node address {}: {}", owner_addr, e)))?;
    url.set_path(path);
    url.query_pairs_mut()
        .extend_pairs(pairs.iter().filter(|(key, _)| key != PARAM_REFERER))
        .append_pair(PARAM_REFERER, referer);
    Ok(url.into())
}

async fn get_metric_histories(
    State(state): State<Arc<QueryState>>,
    Path((app_id, metric_type)): Path<(String, String)>,
    OriginalUri(uri): OriginalUri,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let pairs: Vec<(String, String)> =
        form_urlencoded::parse(query.as_deref().unwrap_or_default().as_bytes())
            .into_owned()
            .collect();
    let params = HistoryParams::parse(&pairs)?;

    if !params.redirected {
        let owner = shard::owner(&app_id, state.node_addrs.len());
        if owner != state.node_index {
            let owner_addr = state.node_addrs.get(owner).map(String::as_str).unwrap_or_default();
            let location = redirect_location(
                &state.redirect_scheme,
                owner_addr,
                uri.path(),
                &pairs,
                state.self_addr(),
            )?;
            debug!(app_id = %app_id, location = %location, "Redirecting query to owning node");
            return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
        }
    }

    let started = Instant::now();
    let result = state
        .querier
        .query_metrics(
            &app_id,
            params.instance_index,
            &metric_type,
            params.start,
            params.end,
            params.order,
        )
        .await;
    state
        .metrics
        .observe_query_latency(started.elapsed().as_secs_f64());

    match result {
        Ok(metrics) => Ok(Json(metrics).into_response()),
        Err(e) => {
            error!(
                app_id = %app_id,
                metric_type = %metric_type,
                error = %e,
                "Failed to get instance metric histories"
            );
            Err(ApiError::internal("Error getting instance metric histories"))
        }
    }
}
