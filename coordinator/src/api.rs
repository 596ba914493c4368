//! HTTP JSON API.
//!
//! One endpoint takes every ledger operation, selected by an `operation`
//! discriminator. Amounts and rates are accepted as JSON strings or
//! numbers; balances are returned as decimal strings.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info};

use atomicledger_common::{
    AccountId, Currency, ExchangeRate, InvoiceId, LedgerError, Money, TradeId, WithdrawId,
};
use atomicledger_ledger::{Balances, LedgerReceipt, MutationPath};

use crate::coordinator::Coordinator;
use crate::trade_manager::SettlementResult;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Create the API router.
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    let state = AppState { coordinator };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/v1/ledger", post(ledger_operation))
        .with_state(state)
}

/// A JSON string or number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Number(serde_json::Number),
    Text(String),
}

impl Numeric {
    fn as_text(&self) -> String {
        match self {
            Numeric::Number(n) => n.to_string(),
            Numeric::Text(s) => s.clone(),
        }
    }
}

/// Request body for `POST /v1/ledger`.
#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum LedgerRequest {
    Deposit {
        account_id: String,
        amount: Numeric,
        currency: String,
        invoice_id: Option<String>,
    },
    Withdraw {
        account_id: String,
        amount: Numeric,
        currency: String,
        withdraw_id: Option<String>,
    },
    Exchange {
        account_id: String,
        from_currency: String,
        to_currency: String,
        amount: Numeric,
        rate: Numeric,
    },
    UpdateInvoiceBalance {
        invoice_id: String,
    },
    UpdateTradeBalance {
        trade_id: String,
    },
    ProcessDeposit {
        account_id: String,
        amount: Numeric,
        currency: String,
        invoice_id: Option<String>,
    },
    CreateBinaryOption {
        account_id: String,
        amount: Numeric,
        currency: String,
        duration_secs: i64,
    },
}

impl LedgerRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            LedgerRequest::Deposit { .. } => "deposit",
            LedgerRequest::Withdraw { .. } => "withdraw",
            LedgerRequest::Exchange { .. } => "exchange",
            LedgerRequest::UpdateInvoiceBalance { .. } => "update_invoice_balance",
            LedgerRequest::UpdateTradeBalance { .. } => "update_trade_balance",
            LedgerRequest::ProcessDeposit { .. } => "process_deposit",
            LedgerRequest::CreateBinaryOption { .. } => "create_binary_option",
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    version: &'static str,
}

// ===== Route Handlers =====

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Response {
    let coordinator = &state.coordinator;
    let code = if coordinator.is_accepting_requests() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: coordinator.state().as_str(),
        node_id: coordinator.node_id().to_string(),
        version: env!("CARGO_PKG_VERSION"),
    };
    (code, Json(body)).into_response()
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<AppState>) -> String {
    state.coordinator.metrics_text()
}

/// Ledger operation endpoint.
async fn ledger_operation(
    State(state): State<AppState>,
    payload: Result<Json<LedgerRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let coordinator = &state.coordinator;
    coordinator.metrics().request_received();
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            coordinator.metrics().request_failed();
            info!(error = %rejection.body_text(), "Rejected malformed ledger request");
            return Err(ApiError::from(rejection));
        }
    };
    let operation = request.operation();

    match execute(coordinator, request).await {
        Ok(fields) => {
            let mut body = Map::new();
            body.insert("success".to_string(), Value::Bool(true));
            body.insert("operation".to_string(), Value::from(operation));
            body.extend(fields);
            Ok(Json(Value::Object(body)))
        }
        Err(e) => {
            coordinator.metrics().request_failed();
            info!(operation, error = %e, code = e.error_code(), "Ledger request failed");
            Err(ApiError(e))
        }
    }
}

async fn execute(
    coordinator: &Coordinator,
    request: LedgerRequest,
) -> Result<Map<String, Value>, LedgerError> {
    match request {
        LedgerRequest::Deposit {
            account_id,
            amount,
            currency,
            invoice_id,
        } => {
            let amount = parse_money(&amount, &currency)?;
            let receipt = coordinator
                .deposit(&AccountId::new(account_id), amount, invoice_id.map(InvoiceId::new))
                .await?;
            Ok(receipt_fields(&receipt))
        }
        LedgerRequest::Withdraw {
            account_id,
            amount,
            currency,
            withdraw_id,
        } => {
            let amount = parse_money(&amount, &currency)?;
            let receipt = coordinator
                .withdraw(&AccountId::new(account_id), amount, withdraw_id.map(WithdrawId::new))
                .await?;
            Ok(receipt_fields(&receipt))
        }
        LedgerRequest::Exchange {
            account_id,
            from_currency,
            to_currency,
            amount,
            rate,
        } => {
            let amount = parse_money(&amount, &from_currency)?;
            let to = parse_currency("to_currency", &to_currency)?;
            let rate = ExchangeRate::parse(&rate.as_text())
                .map_err(|e| LedgerError::invalid_amount("rate", e))?;
            let receipt = coordinator
                .exchange(&AccountId::new(account_id), amount, to, rate)
                .await?;
            let mut fields = receipt_fields(&receipt);
            if let Some(converted) = receipt.converted {
                fields.insert("converted".to_string(), json!(decimal(&converted)));
            }
            Ok(fields)
        }
        LedgerRequest::UpdateInvoiceBalance { invoice_id } => {
            let invoice_id = InvoiceId::new(invoice_id);
            let receipt = coordinator.settle_invoice(&invoice_id).await?;
            let mut fields = receipt_fields(&receipt);
            fields.insert("invoice_id".to_string(), json!(invoice_id.as_str()));
            Ok(fields)
        }
        LedgerRequest::UpdateTradeBalance { trade_id } => {
            let trade_id = TradeId::parse(&trade_id)
                .map_err(|_| LedgerError::invalid("trade_id", "malformed trade id"))?;
            let result = coordinator.settle_trade(&trade_id).await?;
            Ok(settlement_fields(&trade_id, &result))
        }
        LedgerRequest::ProcessDeposit {
            account_id,
            amount,
            currency,
            invoice_id,
        } => {
            let amount = parse_money(&amount, &currency)?;
            let receipt = coordinator
                .process_deposit(&AccountId::new(account_id), amount, invoice_id.map(InvoiceId::new))
                .await?;
            Ok(receipt_fields(&receipt))
        }
        LedgerRequest::CreateBinaryOption {
            account_id,
            amount,
            currency,
            duration_secs,
        } => {
            let stake = parse_money(&amount, &currency)?;
            let trade = coordinator
                .open_trade(&AccountId::new(account_id), stake, duration_secs)
                .await?;
            let mut fields = Map::new();
            fields.insert("trade_id".to_string(), json!(trade.id.to_string()));
            fields.insert("account_id".to_string(), json!(trade.account_id.as_str()));
            fields.insert("amount".to_string(), json!(decimal(&trade.stake)));
            fields.insert("currency".to_string(), json!(trade.stake.currency.code()));
            fields.insert("duration_secs".to_string(), json!(trade.duration_secs));
            fields.insert("settle_at".to_string(), json!(trade.settle_at.to_rfc3339()));
            Ok(fields)
        }
    }
}

fn parse_currency(field: &str, code: &str) -> Result<Currency, LedgerError> {
    code.parse()
        .map_err(|e| LedgerError::invalid_amount(field, e))
}

fn parse_money(amount: &Numeric, currency: &str) -> Result<Money, LedgerError> {
    let currency = parse_currency("currency", currency)?;
    Money::parse_positive(&amount.as_text(), currency)
        .map_err(|e| LedgerError::invalid_amount("amount", e))
}

fn decimal(money: &Money) -> String {
    money.to_decimal().to_string()
}

fn balance_fields(fields: &mut Map<String, Value>, balances: &Balances) {
    for currency in Currency::ALL {
        fields.insert(
            currency.column().to_string(),
            json!(decimal(&balances.money(currency))),
        );
    }
}

fn receipt_fields(receipt: &LedgerReceipt) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("account_id".to_string(), json!(receipt.account_id.as_str()));
    fields.insert("amount".to_string(), json!(decimal(&receipt.amount)));
    fields.insert("currency".to_string(), json!(receipt.amount.currency.code()));
    balance_fields(&mut fields, &receipt.balances);
    fields.insert("already_settled".to_string(), json!(receipt.already_settled));
    if let Some(path) = receipt.path {
        fields.insert("fallback_used".to_string(), json!(path == MutationPath::Optimistic));
    }
    fields
}

fn settlement_fields(trade_id: &TradeId, result: &SettlementResult) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("trade_id".to_string(), json!(trade_id.to_string()));
    match result {
        SettlementResult::Settled {
            outcome,
            credited,
            balances,
        } => {
            fields.insert("is_win".to_string(), json!(outcome.is_win()));
            fields.insert("credited".to_string(), json!(decimal(credited)));
            fields.insert("currency".to_string(), json!(credited.currency.code()));
            balance_fields(&mut fields, balances);
            fields.insert("already_settled".to_string(), json!(false));
        }
        SettlementResult::AlreadySettled { outcome } => {
            fields.insert("is_win".to_string(), json!(outcome.as_ref().map(|o| o.is_win())));
            fields.insert("already_settled".to_string(), json!(true));
        }
        SettlementResult::Degraded { outcome, reason } => {
            fields.insert("is_win".to_string(), json!(outcome.is_win()));
            fields.insert("already_settled".to_string(), json!(false));
            fields.insert("degraded".to_string(), json!(true));
            fields.insert("details".to_string(), json!(reason));
        }
    }
    fields
}

// ===== Error Handling =====

/// API error wrapper.
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(LedgerError::Validation {
            message: rejection.body_text(),
            field: None,
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = &self.0;
        let status = match err {
            LedgerError::Validation { .. } | LedgerError::InsufficientBalance { .. } => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::AccountNotFound(_) | LedgerError::RecordNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Conflict { .. } | LedgerError::ActiveTradeExists(_) => StatusCode::CONFLICT,
            LedgerError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::DatabaseError(_) | LedgerError::InternalError(_) => {
                error!(error = %err, "Internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let details = match err {
            LedgerError::DatabaseError(_) | LedgerError::InternalError(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": err.error_code(),
            "details": details,
        });
        if let Some(field) = err.field() {
            body["field"] = json!(field);
        }
        if let LedgerError::Unavailable { retry_after_ms } = err {
            body["retry_after_ms"] = json!(retry_after_ms);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use atomicledger_ledger::{InMemoryStore, MemoryJournal};

    use crate::config::CoordinatorConfig;
    use crate::notifier::LogNotifier;

    async fn create_test_app() -> (Router, Arc<Coordinator>) {
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            "api-test".to_string(),
            Arc::new(InMemoryStore::new()),
            Arc::new(MemoryJournal::new()),
            Arc::new(LogNotifier),
        ));
        coordinator.start().await.unwrap();
        (create_router(coordinator.clone()), coordinator)
    }

    async fn post(app: &Router, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/ledger")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_deposit_accepts_string_and_number() {
        let (app, _) = create_test_app().await;

        let (status, body) = post(
            &app,
            json!({"operation": "deposit", "account_id": "77", "amount": "1500.50", "currency": "RUB"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["operation"], json!("deposit"));
        assert_eq!(body["balance_rub"], json!("1500.50"));

        let (_, body) = post(
            &app,
            json!({"operation": "deposit", "account_id": "77", "amount": 12.5, "currency": "USDT"}),
        )
        .await;
        assert_eq!(body["balance_usdt"], json!("12.500000"));
        assert_eq!(body["balance_rub"], json!("1500.50"));
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (app, _) = create_test_app().await;
        post(
            &app,
            json!({"operation": "deposit", "account_id": "78", "amount": "10", "currency": "RUB"}),
        )
        .await;

        let (status, body) = post(
            &app,
            json!({"operation": "withdraw", "account_id": "78", "amount": "10.01", "currency": "RUB"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("insufficient_balance"));

        let (status, body) = post(
            &app,
            json!({"operation": "withdraw", "account_id": "79", "amount": "1", "currency": "RUB"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("account_not_found"));

        let (status, body) = post(
            &app,
            json!({"operation": "deposit", "account_id": "78", "amount": "-5", "currency": "RUB"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], json!("amount"));

        let (status, _) = post(
            &app,
            json!({"operation": "deposit", "account_id": "78", "amount": "5", "currency": "EUR"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_exchange_response() {
        let (app, _) = create_test_app().await;
        post(
            &app,
            json!({"operation": "deposit", "account_id": "80", "amount": "100", "currency": "USDT"}),
        )
        .await;

        let (status, body) = post(
            &app,
            json!({
                "operation": "exchange",
                "account_id": "80",
                "from_currency": "USDT",
                "to_currency": "RUB",
                "amount": "10",
                "rate": "92.5"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["converted"], json!("925.00"));
        assert_eq!(body["balance_usdt"], json!("90.000000"));
        assert_eq!(body["balance_rub"], json!("925.00"));
    }

    #[tokio::test]
    async fn test_trade_open_and_settle() {
        let (app, _) = create_test_app().await;
        post(
            &app,
            json!({"operation": "deposit", "account_id": "81", "amount": "100", "currency": "RUB"}),
        )
        .await;

        let (status, body) = post(
            &app,
            json!({
                "operation": "create_binary_option",
                "account_id": "81",
                "amount": 100,
                "currency": "RUB",
                "duration_secs": 60
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let trade_id = body["trade_id"].as_str().unwrap().to_string();

        let (status, body) = post(
            &app,
            json!({
                "operation": "create_binary_option",
                "account_id": "81",
                "amount": 1,
                "currency": "RUB",
                "duration_secs": 60
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("active_trade_exists"));

        let (_, first) = post(&app, json!({"operation": "update_trade_balance", "trade_id": trade_id})).await;
        assert_eq!(first["already_settled"], json!(false));
        let expected = if first["is_win"] == json!(true) { "175.00" } else { "25.00" };
        assert_eq!(first["balance_rub"], json!(expected));

        let (_, second) = post(&app, json!({"operation": "update_trade_balance", "trade_id": trade_id})).await;
        assert_eq!(second["already_settled"], json!(true));
        assert_eq!(second["is_win"], first["is_win"]);
    }

    #[tokio::test]
    async fn test_unavailable_after_stop() {
        let (app, coordinator) = create_test_app().await;
        coordinator.stop().await.unwrap();

        let (status, body) = post(
            &app,
            json!({"operation": "update_invoice_balance", "invoice_id": "inv-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retry_after_ms"], json!(1000));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    async fn post_raw(app: &Router, body: &str, content_type: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/ledger")
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_malformed_requests_are_validation_errors() {
        let (app, coordinator) = create_test_app().await;

        let (status, body) = post(
            &app,
            json!({"operation": "deposit", "account_id": "1", "currency": "RUB"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("validation_error"));
        assert!(body["details"].as_str().unwrap().contains("amount"));

        let (status, body) = post(
            &app,
            json!({"operation": "transfer", "account_id": "1", "amount": "1", "currency": "RUB"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("validation_error"));

        let (status, body) = post_raw(&app, "not json", "application/json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("validation_error"));

        let (status, body) = post_raw(&app, "{}", "text/plain").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("validation_error"));

        let snapshot = coordinator.metrics().snapshot();
        assert_eq!(snapshot.requests_failed, 4);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = create_test_app().await;
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("atomicledger_mutations_applied 0"));
    }
}
