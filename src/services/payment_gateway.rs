//! Payment gateway client (C6): request/response protocol with the
//! external authorization endpoint, classifying failures as retryable vs
//! terminal per §4.4/§4.5/§6.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::PaymentsConfig;

#[derive(Debug, Clone)]
pub enum GatewayOutcome {
    /// 2xx with a non-empty `authorizationId`.
    Authorized { authorization_id: String },
    /// Terminal 4xx, or 2xx with a missing authorization id.
    Terminal { reason: String },
    /// 5xx, timeout, or transport error — safe to retry.
    Retryable { reason: String },
}

#[derive(Serialize)]
struct AuthorizeRequest {
    amount: String,
    currency: &'static str,
    #[serde(rename = "paymentMethod")]
    payment_method: &'static str,
}

#[derive(Serialize)]
struct VoidRequest {
    #[serde(rename = "authorizationId")]
    authorization_id: String,
}

#[derive(Deserialize)]
struct AuthorizeResponse {
    #[serde(rename = "authorizationId")]
    authorization_id: Option<String>,
}

/// Abstracts the outbound call so the payment service can be exercised
/// against a deterministic test double without a network dependency.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authorize(&self, amount: Decimal) -> GatewayOutcome;
    async fn void(&self, authorization_id: &str) -> GatewayOutcome;
}

/// `reqwest`-backed adapter against the configured `auth_url`.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    auth_url: String,
}

impl HttpPaymentGateway {
    pub fn new(config: &PaymentsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("reqwest client configuration is valid");

        Self {
            client,
            auth_url: config.auth_url.clone(),
        }
    }

    fn classify_transport_error(err: &reqwest::Error) -> GatewayOutcome {
        GatewayOutcome::Retryable {
            reason: if err.is_timeout() {
                "gateway request timed out".to_string()
            } else {
                format!("gateway request failed: {err}")
            },
        }
    }

    fn classify_status(status: reqwest::StatusCode, authorization_id: Option<String>) -> GatewayOutcome {
        if status.is_success() {
            match authorization_id {
                Some(id) if !id.is_empty() => GatewayOutcome::Authorized {
                    authorization_id: id,
                },
                _ => GatewayOutcome::Terminal {
                    reason: "gateway returned success with no authorizationId".to_string(),
                },
            }
        } else if crate::services::retry::is_retryable_status(status.as_u16()) {
            GatewayOutcome::Retryable {
                reason: format!("gateway returned retryable status {status}"),
            }
        } else {
            GatewayOutcome::Terminal {
                reason: format!("gateway returned terminal status {status}"),
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn authorize(&self, amount: Decimal) -> GatewayOutcome {
        let body = AuthorizeRequest {
            amount: amount.to_string(),
            currency: "USD",
            payment_method: "CARD",
        };

        let response = match self.client.post(&self.auth_url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => return Self::classify_transport_error(&err),
        };

        let status = response.status();
        let authorization_id = response
            .json::<AuthorizeResponse>()
            .await
            .ok()
            .and_then(|body| body.authorization_id);

        Self::classify_status(status, authorization_id)
    }

    async fn void(&self, authorization_id: &str) -> GatewayOutcome {
        let url = format!("{}/void", self.auth_url);
        let body = VoidRequest {
            authorization_id: authorization_id.to_string(),
        };

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => return Self::classify_transport_error(&err),
        };

        Self::classify_status(response.status(), Some(authorization_id.to_string()))
    }
}

/// Scripted [`PaymentGateway`] double used by `payment_service`/`order_service`
/// tests to exercise retry and cancellation behavior without a network call.
#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    pub struct ScriptedGateway {
        authorize_outcomes: Mutex<VecDeque<GatewayOutcome>>,
        void_outcomes: Mutex<VecDeque<GatewayOutcome>>,
        authorize_calls: AtomicUsize,
        void_calls: AtomicUsize,
    }

    impl ScriptedGateway {
        pub fn new(authorize_outcomes: Vec<GatewayOutcome>, void_outcomes: Vec<GatewayOutcome>) -> Self {
            Self {
                authorize_outcomes: Mutex::new(authorize_outcomes.into()),
                void_outcomes: Mutex::new(void_outcomes.into()),
                authorize_calls: AtomicUsize::new(0),
                void_calls: AtomicUsize::new(0),
            }
        }

        pub fn authorize_calls(&self) -> usize {
            self.authorize_calls.load(Ordering::SeqCst)
        }

        pub fn void_calls(&self) -> usize {
            self.void_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn authorize(&self, _amount: Decimal) -> GatewayOutcome {
            self.authorize_calls.fetch_add(1, Ordering::SeqCst);
            self.authorize_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("authorize called more times than scripted")
        }

        async fn void(&self, _authorization_id: &str) -> GatewayOutcome {
            self.void_calls.fetch_add(1, Ordering::SeqCst);
            self.void_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("void called more times than scripted")
        }
    }
}
