//! Order API handlers (§6): placement, retrieval, payment authorization,
//! cancellation. Each handler recovers the request path via `OriginalUri`
//! and routes its result through [`respond`] so every failure comes back
//! as a Problem Details body with `instance` populated.

use std::sync::Arc;

use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;
use validator::Validate;

use crate::api::extract::{AppJson, AppQuery};
use crate::error::{respond, AppError, AppResult};
use crate::models::{CreateOrderRequest, ListOrdersQuery, OrderResponse, PagedResponse};
use crate::AppState;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
const IDEMPOTENCY_KEY_MAX_LEN: usize = 100;

pub async fn create_order(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    AppJson(request): AppJson<CreateOrderRequest>,
) -> Response {
    respond(&uri, create_order_inner(state, headers, request).await)
}

async fn create_order_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    request: CreateOrderRequest,
) -> AppResult<Response> {
    request.validate()?;
    let idempotency_key = extract_idempotency_key(&headers)?;

    let (order, was_duplicate) = state
        .order_service
        .create_order(request, idempotency_key)
        .await?;

    if was_duplicate && state.config.business.orders.duplicate_as_conflict {
        return Err(AppError::Conflict(format!(
            "order already exists for this idempotency key (id {})",
            order.id
        )));
    }

    let status = if was_duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(order)).into_response())
}

/// Validates the `Idempotency-Key` header per §6: absent is either
/// rejected (the default, `business.orders.require-idempotency-key`) or
/// treated as "no key" by the caller; present must be non-empty, printable
/// and at most 100 characters.
fn extract_idempotency_key(headers: &HeaderMap) -> AppResult<Option<String>> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| AppError::Validation("Idempotency-Key header is not valid UTF-8".to_string()))?;

    if value.is_empty() {
        return Err(AppError::Validation(
            "Idempotency-Key header must not be empty".to_string(),
        ));
    }
    if value.len() > IDEMPOTENCY_KEY_MAX_LEN {
        return Err(AppError::Validation(format!(
            "Idempotency-Key header must be at most {IDEMPOTENCY_KEY_MAX_LEN} characters"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(AppError::Validation(
            "Idempotency-Key header must contain only printable characters".to_string(),
        ));
    }

    Ok(Some(value.to_string()))
}

pub async fn get_order(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<Uuid>,
) -> Response {
    respond(&uri, state.order_service.get_order(id).await.map(Json))
}

pub async fn list_customer_orders(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Path(email): Path<String>,
    AppQuery(query): AppQuery<ListOrdersQuery>,
) -> Response {
    respond(&uri, list_customer_orders_inner(state, email, query).await)
}

async fn list_customer_orders_inner(
    state: Arc<AppState>,
    email: String,
    query: ListOrdersQuery,
) -> AppResult<Json<PagedResponse<OrderResponse>>> {
    let orders_config = &state.config.business.orders;
    let page = query.page.unwrap_or(0);
    let size = query.size.unwrap_or(orders_config.default_page_size);

    if page < 0 {
        return Err(AppError::Validation("page must not be negative".to_string()));
    }
    if size <= 0 {
        return Err(AppError::Validation("size must be positive".to_string()));
    }

    let page_result = state
        .order_service
        .list_customer_orders(&email, page, size)
        .await?;
    Ok(Json(page_result))
}

pub async fn authorize_payment(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<Uuid>,
) -> Response {
    respond(&uri, authorize_payment_inner(state, id).await)
}

async fn authorize_payment_inner(state: Arc<AppState>, id: Uuid) -> AppResult<Json<OrderResponse>> {
    state.payment_service.authorize(id).await?;
    let order = state.order_service.get_order(id).await?;
    Ok(Json(order))
}

pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<Uuid>,
) -> Response {
    respond(&uri, state.order_service.cancel_order(id).await.map(Json))
}
