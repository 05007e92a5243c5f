/// Outbound webhook delivery for downstream integrations
pub mod order_notifications;

pub use order_notifications::{
    NotificationEvent, OrderConfirmedNotification, OrderNotificationService,
};
