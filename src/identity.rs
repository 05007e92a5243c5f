//! Caller identity as established by the upstream auth layer.

use crate::errors::ServiceError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";

/// The current customer, or none for a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Identity(pub Option<Uuid>);

impl Identity {
    pub fn guest() -> Self {
        Self(None)
    }

    pub fn customer(id: Uuid) -> Self {
        Self(Some(id))
    }

    pub fn owner_id(&self) -> Option<Uuid> {
        self.0
    }

    /// The customer id, or `Unauthorized` for guests.
    pub fn require(&self) -> Result<Uuid, ServiceError> {
        self.0
            .ok_or_else(|| ServiceError::Unauthorized("a customer identity is required".to_string()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(CUSTOMER_ID_HEADER) else {
            return Ok(Identity::guest());
        };

        value
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map(Identity::customer)
            .ok_or_else(|| ServiceError::Unauthorized("malformed customer identity".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<Identity, ServiceError> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(CUSTOMER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Identity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn absent_header_is_guest() {
        let identity = extract(None).await.unwrap();
        assert_eq!(identity, Identity::guest());
        assert!(identity.require().is_err());
    }

    #[tokio::test]
    async fn valid_header_is_customer() {
        let id = Uuid::new_v4();
        let identity = extract(Some(&id.to_string())).await.unwrap();
        assert_eq!(identity.require().unwrap(), id);
    }

    #[tokio::test]
    async fn malformed_header_is_rejected() {
        assert!(matches!(
            extract(Some("not-a-uuid")).await,
            Err(ServiceError::Unauthorized(_))
        ));
    }
}
