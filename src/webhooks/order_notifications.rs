use crate::{errors::ServiceError, signing};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the hex HMAC of `"{timestamp}.{body}"`.
pub const SIGNATURE_HEADER: &str = "X-Storefront-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Storefront-Timestamp";

/// Outbound webhook envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationEvent {
    #[serde(rename = "order.confirmed")]
    OrderConfirmed { data: OrderConfirmedNotification },
}

/// Payload describing a freshly confirmed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmedNotification {
    pub order_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub total: Decimal,
    pub currency: String,
    pub provider: Option<String>,
    pub payment_id: Option<String>,
    pub confirmed_at: DateTime<Utc>,
}

/// Delivers order notifications with retry and exponential backoff.
#[derive(Clone)]
pub struct OrderNotificationService {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
    max_retries: u32,
    base_backoff: Duration,
}

impl OrderNotificationService {
    pub fn new(
        endpoint: String,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            secret,
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        })
    }

    /// Overrides the first retry delay; later delays double.
    pub fn with_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    /// Queue a confirmation notification (fire-and-forget with logging)
    pub async fn notify_order_confirmed(
        &self,
        data: OrderConfirmedNotification,
    ) -> Result<(), ServiceError> {
        let event = NotificationEvent::OrderConfirmed { data };
        let body = serde_json::to_string(&event)?;
        let service = self.clone();

        tokio::spawn(async move {
            if let Err(e) = service.deliver(body).await {
                error!("Order notification delivery failed: {}", e);
            }
        });
        Ok(())
    }

    /// Signs and posts one payload, retrying on transport errors and non-2xx.
    #[instrument(skip(self, body), fields(endpoint = %self.endpoint))]
    pub async fn deliver(&self, body: String) -> Result<(), ServiceError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = match &self.secret {
            Some(secret) => Some(signing::sign_hex(
                secret.as_bytes(),
                format!("{}.{}", timestamp, body).as_bytes(),
            )?),
            None => None,
        };

        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .header(TIMESTAMP_HEADER, &timestamp)
                .body(body.clone());

            if let Some(ref sig) = signature {
                request = request.header(SIGNATURE_HEADER, sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Order notification delivered");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        "Order notification rejected with status: {} (attempt {}/{})",
                        response.status(),
                        attempt,
                        self.max_retries
                    );
                }
                Err(e) => {
                    warn!(
                        "Order notification error: {} (attempt {}/{})",
                        e, attempt, self.max_retries
                    );
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.base_backoff * 2_u32.pow(attempt - 1)).await;
            }
        }

        Err(ServiceError::ExternalServiceError(format!(
            "Failed to deliver order notification after {} attempts",
            self.max_retries
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample() -> OrderConfirmedNotification {
        OrderConfirmedNotification {
            order_id: Uuid::new_v4(),
            owner_id: None,
            total: dec!(160.00),
            currency: "INR".into(),
            provider: Some("stripe".into()),
            payment_id: Some("pi_123".into()),
            confirmed_at: Utc::now(),
        }
    }

    #[test]
    fn envelope_is_tagged() {
        let json = serde_json::to_value(NotificationEvent::OrderConfirmed { data: sample() })
            .unwrap();
        assert_eq!(json["type"], "order.confirmed");
        assert_eq!(json["data"]["currency"], "INR");
    }

    #[tokio::test]
    async fn delivery_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/orders"))
            .and(header_exists("x-storefront-signature"))
            .and(header_exists("x-storefront-timestamp"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let service = OrderNotificationService::new(
            format!("{}/hooks/orders", server.uri()),
            Some("notify-secret".into()),
            Duration::from_secs(2),
        )
        .unwrap();

        service.deliver("{}".into()).await.unwrap();
    }

    #[tokio::test]
    async fn delivery_retries_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let service =
            OrderNotificationService::new(server.uri(), None, Duration::from_secs(2))
                .unwrap()
                .with_backoff(Duration::from_millis(1));

        let err = service.deliver("{}".into()).await.unwrap_err();
        assert!(matches!(err, ServiceError::ExternalServiceError(_)));
    }
}
