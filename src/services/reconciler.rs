use crate::{
    entities::{order, Order, OrderModel, OrderSource, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    services::{
        cart::CartService,
        gateways::{
            ClientConfirmation, GatewayCallback, GatewayProvider, GatewayRegistry, Verification,
            VerifiedPayment,
        },
        orders::OrderService,
        pricing::{from_minor_units, to_minor_units},
    },
};
use chrono::Utc;
use sea_orm::{sea_query::OnConflict, DatabaseConnection, EntityTrait, Set, TransactionTrait};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Confirmed { order_id: Uuid },
    /// Redelivery or a lost race; nothing was written
    AlreadyConfirmed { order_id: Uuid },
    /// Authentic event that does not confirm a payment
    Ignored { event_type: String },
}

impl ReconcileOutcome {
    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            Self::Confirmed { order_id } | Self::AlreadyConfirmed { order_id } => Some(*order_id),
            Self::Ignored { .. } => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Confirmed { .. } => "confirmed",
            Self::AlreadyConfirmed { .. } => "duplicate",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Trust boundary between gateway callbacks and local order state.
///
/// Every callback is authenticated by its gateway before any field is read.
/// Confirmation is a compare-and-set on status inside a transaction that also
/// clears the owner's cart, so redelivered webhooks and a webhook racing the
/// client confirmation confirm once and clear once.
#[derive(Clone)]
pub struct PaymentReconciler {
    db: Arc<DatabaseConnection>,
    orders: Arc<OrderService>,
    gateways: GatewayRegistry,
    event_sender: Arc<EventSender>,
    currency: String,
}

impl PaymentReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: Arc<OrderService>,
        gateways: GatewayRegistry,
        event_sender: Arc<EventSender>,
        currency: String,
    ) -> Self {
        Self {
            db,
            orders,
            gateways,
            event_sender,
            currency,
        }
    }

    /// Handles a signed server-to-server event.
    #[instrument(skip(self, signature_header, payload), fields(provider = %provider, bytes = payload.len()))]
    pub async fn handle_webhook(
        &self,
        provider: GatewayProvider,
        signature_header: Option<&str>,
        payload: &[u8],
    ) -> Result<ReconcileOutcome, ServiceError> {
        // Without a configured gateway there is no secret to verify against
        let gateway = self.gateways.get(provider).map_err(|_| {
            self.rejected(
                provider,
                ServiceError::InvalidWebhookSignature(format!(
                    "{} webhooks are not configured",
                    provider
                )),
            )
        })?;
        let verification = gateway
            .verify(GatewayCallback::Webhook {
                signature_header,
                payload,
            })
            .map_err(|e| self.rejected(provider, e))?;

        let outcome = match verification {
            Verification::Ignored { event_type } => {
                info!(event_type = %event_type, "webhook event acknowledged without action");
                ReconcileOutcome::Ignored { event_type }
            }
            Verification::Payment(payment) => match payment.order_id {
                Some(order_id) => {
                    let order = self.load(order_id).await?;
                    self.confirm(order, &payment).await?
                }
                None => self.confirm_unreferenced(&payment).await?,
            },
        };

        metrics::ORDER_CONFIRMATIONS
            .with_label_values(&[outcome.label()])
            .inc();
        Ok(outcome)
    }

    /// Handles a payment the browser reports after the modal closed. The
    /// relayed signature must verify and must be for the session recorded on
    /// the order.
    #[instrument(skip(self, confirmation), fields(provider = %provider, order_id = %confirmation.order_id))]
    pub async fn verify_client_payment(
        &self,
        provider: GatewayProvider,
        confirmation: &ClientConfirmation,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let gateway = self.gateways.get(provider)?;
        let verification = gateway
            .verify(GatewayCallback::Client(confirmation))
            .map_err(|e| self.rejected(provider, e))?;

        let Verification::Payment(payment) = verification else {
            return Err(ServiceError::BadRequest(
                "confirmation does not describe a payment".to_string(),
            ));
        };

        let order = self.load(confirmation.order_id).await?;
        if order.gateway_session_id.as_deref() != Some(payment.session_id.as_str()) {
            return Err(self.rejected(
                provider,
                ServiceError::SignatureMismatch(format!(
                    "gateway order {} does not belong to order {}",
                    payment.session_id, order.id
                )),
            ));
        }

        let outcome = self.confirm(order, &payment).await?;
        metrics::ORDER_CONFIRMATIONS
            .with_label_values(&[outcome.label()])
            .inc();
        Ok(outcome)
    }

    async fn load(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Applies the confirmed transition exactly once.
    async fn confirm(
        &self,
        order: OrderModel,
        payment: &VerifiedPayment,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if order.status == OrderStatus::Confirmed {
            info!(order_id = %order.id, "order already confirmed");
            return Ok(ReconcileOutcome::AlreadyConfirmed { order_id: order.id });
        }

        if let Some(reported) = payment.amount_minor {
            let expected = to_minor_units(order.total)?;
            if reported != expected {
                return Err(self.rejected(
                    payment.provider,
                    ServiceError::AmountMismatch {
                        order_id: order.id,
                        expected,
                        reported,
                    },
                ));
            }
        }

        if order.status == OrderStatus::Expired {
            warn!(order_id = %order.id, "confirming an expired order; payment was taken");
        }

        let confirmed_at = Utc::now();
        let txn = self.db.begin().await?;

        let won = OrderService::confirm_in(
            &txn,
            order.id,
            payment.payment_id.as_deref(),
            confirmed_at,
        )
        .await?;
        if !won {
            txn.rollback().await?;
            info!(order_id = %order.id, "concurrent confirmation already applied");
            return Ok(ReconcileOutcome::AlreadyConfirmed { order_id: order.id });
        }

        let cleared = match (order.source, order.owner_id) {
            (OrderSource::Cart, Some(owner_id)) => CartService::clear_in(&txn, owner_id).await?,
            _ => 0,
        };

        txn.commit().await?;

        if let (Some(owner_id), true) = (order.owner_id, cleared > 0) {
            self.event_sender
                .send_or_log(Event::CartCleared {
                    owner_id,
                    lines: cleared,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::OrderConfirmed {
                order_id: order.id,
                owner_id: order.owner_id,
                total: order.total,
                currency: order.currency.clone(),
                provider: Some(payment.provider.to_string()),
                payment_id: payment.payment_id.clone(),
                confirmed_at,
            })
            .await;

        info!(order_id = %order.id, cleared, "order confirmed");
        Ok(ReconcileOutcome::Confirmed { order_id: order.id })
    }

    /// Confirms a payment whose event carries no local order reference. The
    /// order is found by gateway session, or synthesized from the event's own
    /// total. The unique session index makes concurrent synthesis insert once.
    async fn confirm_unreferenced(
        &self,
        payment: &VerifiedPayment,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if let Some(order) = self.orders.find_by_session(&payment.session_id).await? {
            return self.confirm(order, payment).await;
        }

        let amount_minor = payment.amount_minor.ok_or_else(|| {
            ServiceError::BadRequest("payment event carries no order reference or amount".to_string())
        })?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let total = from_minor_units(amount_minor);
        let currency = payment
            .currency
            .clone()
            .unwrap_or_else(|| self.currency.clone());

        let synthesized = order::ActiveModel {
            id: Set(order_id),
            owner_id: Set(None),
            total: Set(total),
            currency: Set(currency.clone()),
            status: Set(OrderStatus::Confirmed),
            source: Set(OrderSource::Gateway),
            gateway_provider: Set(Some(payment.provider.to_string())),
            gateway_session_id: Set(Some(payment.session_id.clone())),
            gateway_payment_id: Set(payment.payment_id.clone()),
            created_at: Set(now),
            updated_at: Set(now),
            confirmed_at: Set(Some(now)),
        };

        let inserted = Order::insert(synthesized)
            .on_conflict(
                OnConflict::column(order::Column::GatewaySessionId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        if inserted == 0 {
            // Another delivery got there first
            let existing = self
                .orders
                .find_by_session(&payment.session_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "session {} conflicted but no order holds it",
                        payment.session_id
                    ))
                })?;
            return self.confirm(existing, payment).await;
        }

        warn!(%order_id, session_id = %payment.session_id, "synthesized order from unreferenced payment");
        self.event_sender
            .send_or_log(Event::OrderConfirmed {
                order_id,
                owner_id: None,
                total,
                currency,
                provider: Some(payment.provider.to_string()),
                payment_id: payment.payment_id.clone(),
                confirmed_at: now,
            })
            .await;

        Ok(ReconcileOutcome::Confirmed { order_id })
    }

    /// Records a verification failure in the security log and passes the
    /// error through unchanged.
    fn rejected(&self, provider: GatewayProvider, err: ServiceError) -> ServiceError {
        let counter = match &err {
            ServiceError::SignatureMismatch(_) | ServiceError::InvalidWebhookSignature(_) => {
                Some(&*metrics::SIGNATURE_REJECTIONS)
            }
            ServiceError::AmountMismatch { .. } => Some(&*metrics::AMOUNT_MISMATCHES),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.with_label_values(&[&provider.to_string()]).inc();
            warn!(target: "security", provider = %provider, error = %err, "payment verification rejected");

            let sender = self.event_sender.clone();
            let event = Event::PaymentVerificationFailed {
                provider: provider.to_string(),
                reason: err.to_string(),
            };
            tokio::spawn(async move { sender.send_or_log(event).await });
        }
        err
    }
}
