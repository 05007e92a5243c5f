use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::webhooks::OrderNotificationService;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the processor is gone.
    /// Events are emitted after the state change committed, so a dropped
    /// event must never turn a successful operation into an error.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Domain events emitted after the corresponding state change committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartItemAdded {
        owner_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemUpdated {
        owner_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        owner_id: Uuid,
        product_id: Uuid,
    },
    CartCleared {
        owner_id: Uuid,
        lines: u64,
    },

    // Order events
    OrderCreated {
        order_id: Uuid,
        total: Decimal,
        item_count: usize,
    },
    OrderSessionOpened {
        order_id: Uuid,
        provider: String,
        session_id: String,
    },
    OrderConfirmed {
        order_id: Uuid,
        owner_id: Option<Uuid>,
        total: Decimal,
        currency: String,
        provider: Option<String>,
        payment_id: Option<String>,
        confirmed_at: DateTime<Utc>,
    },
    OrdersExpired {
        order_ids: Vec<Uuid>,
    },

    // Security events
    PaymentVerificationFailed {
        provider: String,
        reason: String,
    },
}

/// Background consumer of the event channel. Confirmed orders are forwarded
/// to the downstream notification endpoint when one is configured.
pub async fn process_events(
    mut rx: mpsc::Receiver<Event>,
    notifier: Option<Arc<OrderNotificationService>>,
) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderConfirmed {
                order_id,
                owner_id,
                total,
                currency,
                provider,
                payment_id,
                confirmed_at,
            } => {
                info!(
                    %order_id,
                    %total,
                    currency = %currency,
                    provider = provider.as_deref().unwrap_or("unknown"),
                    "order confirmed"
                );
                if let Some(notifier) = &notifier {
                    let notification = crate::webhooks::OrderConfirmedNotification {
                        order_id,
                        owner_id,
                        total,
                        currency,
                        provider,
                        payment_id,
                        confirmed_at,
                    };
                    if let Err(e) = notifier.notify_order_confirmed(notification).await {
                        error!(
                            "Failed to dispatch order confirmation: order_id={}, error={}",
                            order_id, e
                        );
                    }
                }
            }
            Event::PaymentVerificationFailed { provider, reason } => {
                warn!(target: "security", provider = %provider, reason = %reason, "payment verification failed");
            }
            Event::OrdersExpired { order_ids } => {
                info!(count = order_ids.len(), "stale orders expired");
            }
            other => {
                info!("Received event: {:?}", other);
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender
            .send(Event::CartCleared {
                owner_id: Uuid::new_v4(),
                lines: 1
            })
            .await
            .is_err());
        sender
            .send_or_log(Event::CartCleared {
                owner_id: Uuid::new_v4(),
                lines: 1,
            })
            .await;
    }

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();
        sender
            .send_or_log(Event::OrderCreated {
                order_id,
                total: Decimal::from(160),
                item_count: 1,
            })
            .await;
        sender
            .send_or_log(Event::OrdersExpired {
                order_ids: vec![order_id],
            })
            .await;

        assert!(matches!(rx.recv().await, Some(Event::OrderCreated { .. })));
        assert!(matches!(rx.recv().await, Some(Event::OrdersExpired { .. })));
    }
}
