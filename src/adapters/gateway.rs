//! JSON-over-HTTP binding of [`PaymentGateway`].
//!
//! Requests go to `POST {base}/v1/{operation}` with a bearer key. Raw
//! processor response codes are classified here and nowhere else.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::gateway::{
    CaptureCall, FailureCategory, GatewayApproval, GatewayFailure, GatewayResult, PaymentCall,
    RefundCall, VoidCall,
};
use crate::ports::PaymentGateway;

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    approved: bool,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    response_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Maps a processor decline code to a terminal or retriable failure.
pub fn classify_decline(code: Option<&str>, message: &str) -> GatewayFailure {
    match code {
        Some("51") => GatewayFailure::terminal(FailureCategory::InsufficientFunds, code, message),
        Some("59") | Some("63") => GatewayFailure::terminal(FailureCategory::Fraud, code, message),
        Some("91") | Some("96") => {
            let mut failure = GatewayFailure::retriable(FailureCategory::Upstream, message);
            failure.code = code.map(str::to_string);
            failure
        }
        Some("12") | Some("13") | Some("14") | Some("30") => {
            GatewayFailure::terminal(FailureCategory::InvalidRequest, code, message)
        }
        _ => GatewayFailure::terminal(FailureCategory::Declined, code, message),
    }
}

fn classify_transport(err: &reqwest::Error) -> GatewayFailure {
    if err.is_timeout() {
        GatewayFailure::retriable(FailureCategory::Timeout, format!("gateway request timed out: {}", err))
    } else {
        GatewayFailure::retriable(FailureCategory::Network, format!("gateway unreachable: {}", err))
    }
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    circuit_breaker: Breaker,
}

impl HttpGateway {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Self {
        Self::with_circuit_breaker(base_url, api_key, timeout, 5, 30)
    }

    pub fn with_circuit_breaker(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        Self {
            client,
            base_url,
            api_key,
            circuit_breaker,
        }
    }

    pub fn circuit_state(&self) -> String {
        if self.circuit_breaker.is_call_permitted() {
            "closed".to_string()
        } else {
            "open".to_string()
        }
    }

    async fn post<B: Serialize + Sync>(&self, operation: &str, body: &B) -> GatewayResult {
        let url = format!("{}/v1/{}", self.base_url.trim_end_matches('/'), operation);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        // Only infrastructure failures count against the breaker; declines are
        // ordinary answers and pass through as `Ok(Err(..))`.
        let result = self
            .circuit_breaker
            .call(async move {
                let response = request.send().await.map_err(|e| classify_transport(&e))?;
                let status = response.status();

                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(GatewayFailure::retriable(
                        FailureCategory::RateLimited,
                        "gateway rate limit exceeded",
                    ));
                }
                if status.is_server_error() {
                    return Err(GatewayFailure::retriable(
                        FailureCategory::Upstream,
                        format!("gateway returned {}", status),
                    ));
                }
                if status.is_client_error() {
                    let text = response.text().await.unwrap_or_default();
                    return Ok(Err(GatewayFailure::terminal(
                        FailureCategory::InvalidRequest,
                        Some(status.as_str()),
                        format!("gateway rejected request: {}", text),
                    )));
                }

                // A 2xx we cannot read leaves the outcome unknown.
                let body: GatewayResponse = response.json().await.map_err(|e| {
                    GatewayFailure::retriable(
                        FailureCategory::Upstream,
                        format!("unreadable gateway response: {}", e),
                    )
                })?;
                Ok::<GatewayResult, GatewayFailure>(interpret(body))
            })
            .await;

        match result {
            Ok(outcome) => outcome,
            Err(FailsafeError::Rejected) => Err(GatewayFailure::retriable(
                FailureCategory::Upstream,
                "gateway circuit breaker is open",
            )),
            Err(FailsafeError::Inner(failure)) => Err(failure),
        }
    }
}

fn interpret(body: GatewayResponse) -> GatewayResult {
    let message = body.message.unwrap_or_default();
    if !body.approved {
        return Err(classify_decline(body.response_code.as_deref(), &message));
    }
    match body.reference {
        Some(reference) => Ok(GatewayApproval {
            reference,
            response_code: body.response_code.unwrap_or_else(|| "00".to_string()),
            message,
        }),
        None => Err(GatewayFailure::retriable(
            FailureCategory::Upstream,
            "approved response carried no reference",
        )),
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn authorize(&self, call: &PaymentCall) -> GatewayResult {
        self.post("authorize", call).await
    }

    async fn sale(&self, call: &PaymentCall) -> GatewayResult {
        self.post("sale", call).await
    }

    async fn capture(&self, call: &CaptureCall) -> GatewayResult {
        self.post("capture", call).await
    }

    async fn void(&self, call: &VoidCall) -> GatewayResult {
        self.post("void", call).await
    }

    async fn refund(&self, call: &RefundCall) -> GatewayResult {
        self.post("refund", call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment_call() -> PaymentCall {
        PaymentCall {
            merchant_id: "merchant-1".to_string(),
            customer_id: "customer-1".to_string(),
            amount: "10.00".parse().unwrap(),
            currency: "USD".to_string(),
            payment_token: "tok_visa".to_string(),
            reference: "key-1".to_string(),
        }
    }

    #[test]
    fn test_decline_codes_are_classified() {
        assert_eq!(classify_decline(Some("51"), "nsf").category, FailureCategory::InsufficientFunds);
        assert_eq!(classify_decline(Some("59"), "fraud").category, FailureCategory::Fraud);
        assert!(classify_decline(Some("91"), "issuer down").retriable);
        assert!(!classify_decline(Some("05"), "do not honor").retriable);
        assert!(!classify_decline(None, "declined").retriable);
    }

    #[tokio::test]
    async fn test_approval_is_parsed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/authorize")
            .match_header("authorization", "Bearer secret-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"approved": true, "reference": "bric-123", "response_code": "00", "message": "APPROVAL"}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(server.url(), Some("secret-key".to_string()), Duration::from_secs(5));
        let approval = gateway.authorize(&payment_call()).await.unwrap();

        assert_eq!(approval.reference, "bric-123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_decline_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/sale")
            .with_status(200)
            .with_body(r#"{"approved": false, "response_code": "51", "message": "insufficient funds"}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(server.url(), None, Duration::from_secs(5));
        let failure = gateway.sale(&payment_call()).await.unwrap_err();

        assert!(!failure.retriable);
        assert_eq!(failure.category, FailureCategory::InsufficientFunds);
        assert_eq!(gateway.circuit_state(), "closed");
    }

    #[tokio::test]
    async fn test_server_error_is_retriable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/sale")
            .with_status(503)
            .create_async()
            .await;

        let gateway = HttpGateway::new(server.url(), None, Duration::from_secs(5));
        let failure = gateway.sale(&payment_call()).await.unwrap_err();

        assert!(failure.retriable);
        assert_eq!(failure.category, FailureCategory::Upstream);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_outages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/sale")
            .with_status(502)
            .expect_at_least(1)
            .create_async()
            .await;

        let gateway = HttpGateway::with_circuit_breaker(server.url(), None, Duration::from_secs(5), 2, 60);
        for _ in 0..3 {
            let failure = gateway.sale(&payment_call()).await.unwrap_err();
            assert!(failure.retriable);
        }
        assert_eq!(gateway.circuit_state(), "open");
    }
}
