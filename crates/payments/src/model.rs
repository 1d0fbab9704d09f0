//! Canonical payment model.
//!
//! Every vendor adapter translates its wire formats into these types, so the
//! reconciler and ledger never see vendor-specific payloads. The serde wire
//! values here are also what lands in the database status columns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::PaymentError;

/// Lifecycle state of a single payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Processing,
    #[serde(rename = "paid")]
    Success,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Processing => "processing",
            PaymentStatus::Success => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }
}

/// What kind of purchase an order represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    #[serde(rename = "one-time")]
    OneTime,
    Subscription,
    /// A renewal charge on an existing subscription. Never requested by a
    /// user; only minted by the reconciler when a billing cycle recurs.
    Renew,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OneTime => "one-time",
            PaymentType::Subscription => "subscription",
            PaymentType::Renew => "renew",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one-time" => Some(PaymentType::OneTime),
            "subscription" => Some(PaymentType::Subscription),
            "renew" => Some(PaymentType::Renew),
            _ => None,
        }
    }
}

/// Billing interval for recurring prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentInterval {
    #[serde(rename = "one-time")]
    OneTime,
    Day,
    Week,
    Month,
    Year,
}

impl PaymentInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentInterval::OneTime => "one-time",
            PaymentInterval::Day => "day",
            PaymentInterval::Week => "week",
            PaymentInterval::Month => "month",
            PaymentInterval::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one-time" => Some(PaymentInterval::OneTime),
            "day" => Some(PaymentInterval::Day),
            "week" => Some(PaymentInterval::Week),
            "month" => Some(PaymentInterval::Month),
            "year" => Some(PaymentInterval::Year),
            _ => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, PaymentInterval::OneTime)
    }
}

/// Canonical webhook event taxonomy. Vendor event names map onto these; an
/// event name outside a vendor's known set is a hard error, never a silent
/// acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventType {
    CheckoutSuccess,
    PaymentSuccess,
    PaymentFailed,
    PaymentRefunded,
    SubscribeUpdated,
    SubscribeCanceled,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventType::CheckoutSuccess => "checkout_success",
            PaymentEventType::PaymentSuccess => "payment_success",
            PaymentEventType::PaymentFailed => "payment_failed",
            PaymentEventType::PaymentRefunded => "payment_refunded",
            PaymentEventType::SubscribeUpdated => "subscribe_updated",
            PaymentEventType::SubscribeCanceled => "subscribe_canceled",
        }
    }
}

/// Whether a successful subscription charge opened the subscription or
/// renewed an existing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionCycleType {
    Create,
    Renewal,
}

/// Price to charge, in the currency's smallest unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPrice {
    pub currency: String,
    /// Amount in minor units (cents for USD).
    pub amount: i64,
    pub interval: PaymentInterval,
    /// Vendor-side price/product identifier, when the catalog pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub product_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCustomer {
    pub user_id: String,
    pub email: String,
}

/// Everything an adapter needs to create a vendor checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub order_no: String,
    pub payment_type: PaymentType,
    pub price: PaymentPrice,
    pub customer: PaymentCustomer,
    pub success_url: String,
    pub cancel_url: String,
    /// Opaque pass-through metadata persisted with the order.
    #[serde(default)]
    pub metadata: Value,
}

/// Result of creating a vendor checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub provider: String,
    pub session_id: String,
    pub checkout_url: String,
    /// Raw vendor response, persisted on the order for audit.
    #[serde(default)]
    pub checkout_result: Value,
}

/// Payment facts extracted from a vendor session or charge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
}

/// Subscription facts extracted from a vendor session or event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub provider_subscription_id: String,
    pub status: String,
    pub cycle: SubscriptionCycleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    /// Raw vendor subscription object, persisted for audit.
    #[serde(default)]
    pub raw: Value,
}

/// The normalized view of one vendor session, tied back to our order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub provider: String,
    pub session_id: String,
    /// Absent for renewal charges, which have no originating checkout order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    #[serde(default)]
    pub payment: PaymentDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionDetails>,
}

/// A parsed, signature-verified webhook delivery.
///
/// `session` is absent for events that carry no ledger-relevant session
/// (for example a subscription deletion keyed only by subscription id);
/// such events are still acknowledged after their own handling.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub event_type: PaymentEventType,
    pub session: Option<PaymentSession>,
    pub subscription: Option<SubscriptionDetails>,
    /// The raw vendor event payload.
    pub raw: Value,
}

/// Order lifecycle states.
///
/// `pending` becomes `created` once the vendor session exists, then `paid`
/// or `failed` on reconciliation. `completed` marks a checkout that failed
/// before a vendor session existed and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Created,
    Completed,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Created => "created",
            OrderStatus::Completed => "completed",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PaymentError> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "created" => Ok(OrderStatus::Created),
            "completed" => Ok(OrderStatus::Completed),
            "paid" => Ok(OrderStatus::Paid),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(PaymentError::Validation(format!(
                "unknown order status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Paid | OrderStatus::Failed
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_values() {
        assert_eq!(PaymentStatus::Success.as_str(), "paid");
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Success).unwrap(),
            "\"paid\""
        );
        assert_eq!(
            serde_json::from_str::<PaymentStatus>("\"cancelled\"").unwrap(),
            PaymentStatus::Cancelled
        );
    }

    #[test]
    fn payment_type_round_trips_wire_values() {
        assert_eq!(PaymentType::OneTime.as_str(), "one-time");
        assert_eq!(PaymentType::parse("one-time"), Some(PaymentType::OneTime));
        assert_eq!(PaymentType::parse("renew"), Some(PaymentType::Renew));
        assert_eq!(PaymentType::parse("gift"), None);
    }

    #[test]
    fn interval_recurring() {
        assert!(!PaymentInterval::OneTime.is_recurring());
        assert!(PaymentInterval::Month.is_recurring());
        assert_eq!(PaymentInterval::parse("year"), Some(PaymentInterval::Year));
    }

    #[test]
    fn order_status_transitions() {
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Completed.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::parse("bogus").is_err());
    }
}
