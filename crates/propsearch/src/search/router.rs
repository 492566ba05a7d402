use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::domain::{AccountId, HistoryId, SearchRequest};
use super::orchestrator::{SearchError, SearchOrchestrator};
use super::provider::PropertyDataProvider;
use super::store::SearchStore;

/// Header carrying the caller's account, set by the authenticating gateway.
pub const ACCOUNT_HEADER: &str = "x-account-id";

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageQuery {
    limit: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

/// Router builder exposing search, upgrade, and credit endpoints.
pub fn search_router<S, P>(orchestrator: Arc<SearchOrchestrator<S, P>>) -> Router
where
    S: SearchStore + ?Sized + 'static,
    P: PropertyDataProvider + ?Sized + 'static,
{
    Router::new()
        .route(
            "/api/v1/searches",
            post(search_handler::<S, P>).get(history_handler::<S, P>),
        )
        .route(
            "/api/v1/searches/:history_id/upgrade",
            post(upgrade_handler::<S, P>),
        )
        .route("/api/v1/credits", get(balance_handler::<S, P>))
        .route(
            "/api/v1/credits/transactions",
            get(transactions_handler::<S, P>),
        )
        .with_state(orchestrator)
}

fn caller(headers: &HeaderMap) -> Option<AccountId> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| AccountId(value.to_string()))
}

pub(crate) fn error_status(err: &SearchError) -> StatusCode {
    match err {
        SearchError::Unauthenticated => StatusCode::UNAUTHORIZED,
        SearchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SearchError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        SearchError::SearchFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SearchError::HistoryNotFound(_) => StatusCode::NOT_FOUND,
        SearchError::AlreadyUpgraded(_) | SearchError::SearchInProgress(_) => StatusCode::CONFLICT,
        SearchError::ProviderUnavailable(_)
        | SearchError::HistoryWriteFailed(_)
        | SearchError::HistoryUnavailable(_)
        | SearchError::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SearchError::ReconciliationNeeded { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: &SearchError) -> Response {
    let mut payload = json!({
        "error": err.kind(),
        "message": err.to_string(),
        "retryable": err.is_retryable(),
    });
    if let SearchError::InsufficientCredits {
        available,
        required,
    } = err
    {
        payload["available_credits"] = json!(available);
        payload["required_credits"] = json!(required);
    }
    (error_status(err), Json(payload)).into_response()
}

fn aborted_task(err: tokio::task::JoinError) -> Response {
    error!(error = %err, "search task aborted");
    let payload = json!({
        "error": "internal",
        "message": "search task aborted",
        "retryable": false,
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
}

// Runs on its own task so a dropped connection cannot cancel the run between the
// history write and the debit.
pub(crate) async fn search_handler<S, P>(
    State(orchestrator): State<Arc<SearchOrchestrator<S, P>>>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> Response
where
    S: SearchStore + ?Sized + 'static,
    P: PropertyDataProvider + ?Sized + 'static,
{
    let caller = caller(&headers);
    let task =
        tokio::spawn(async move { orchestrator.perform_search(caller.as_ref(), request).await });

    match task.await {
        Ok(Ok(result)) => (StatusCode::OK, Json(result)).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(err) => aborted_task(err),
    }
}

pub(crate) async fn upgrade_handler<S, P>(
    State(orchestrator): State<Arc<SearchOrchestrator<S, P>>>,
    headers: HeaderMap,
    Path(history_id): Path<String>,
) -> Response
where
    S: SearchStore + ?Sized + 'static,
    P: PropertyDataProvider + ?Sized + 'static,
{
    let caller = caller(&headers);
    let history_id = HistoryId(history_id);
    let task = tokio::spawn(async move {
        orchestrator
            .upgrade_search(caller.as_ref(), &history_id)
            .await
    });

    match task.await {
        Ok(Ok(result)) => (StatusCode::OK, Json(result)).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(err) => aborted_task(err),
    }
}

pub(crate) async fn history_handler<S, P>(
    State(orchestrator): State<Arc<SearchOrchestrator<S, P>>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response
where
    S: SearchStore + ?Sized + 'static,
    P: PropertyDataProvider + ?Sized + 'static,
{
    let caller = caller(&headers);
    match orchestrator.history(caller.as_ref(), page.limit()).await {
        Ok(records) => (StatusCode::OK, Json(json!({ "searches": records }))).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn balance_handler<S, P>(
    State(orchestrator): State<Arc<SearchOrchestrator<S, P>>>,
    headers: HeaderMap,
) -> Response
where
    S: SearchStore + ?Sized + 'static,
    P: PropertyDataProvider + ?Sized + 'static,
{
    let caller = caller(&headers);
    match orchestrator.balance(caller.as_ref()).await {
        Ok(balance) => (StatusCode::OK, Json(balance)).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn transactions_handler<S, P>(
    State(orchestrator): State<Arc<SearchOrchestrator<S, P>>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response
where
    S: SearchStore + ?Sized + 'static,
    P: PropertyDataProvider + ?Sized + 'static,
{
    let caller = caller(&headers);
    match orchestrator.transactions(caller.as_ref(), page.limit()).await {
        Ok(entries) => (StatusCode::OK, Json(json!({ "transactions": entries }))).into_response(),
        Err(err) => error_response(&err),
    }
}
