use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("payment provider not found: {0}")]
    ProviderNotFound(String),

    #[error("no payment provider configured")]
    NoProviderConfigured,

    #[error("{provider} error: {message}")]
    Vendor { provider: String, message: String },

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("missing webhook signature header: {0}")]
    MissingSignature(String),

    #[error("unknown {provider} payment status: {status}")]
    UnknownStatus { provider: String, status: String },

    #[error("unhandled {provider} event type: {event}")]
    UnknownEvent { provider: String, event: String },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PaymentError {
    pub fn vendor(provider: impl Into<String>, message: impl Into<String>) -> Self {
        PaymentError::Vendor {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Postgres unique-constraint violations signal "already applied" for the
/// ledger's idempotency checks.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}
