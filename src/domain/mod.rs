//! Framework-agnostic payment records and the rules that govern them.

pub mod audit;
pub mod chargeback;
pub mod gateway;
pub mod idempotency;
pub mod money;
pub mod subscription;
pub mod transaction;
pub mod webhook;

pub use audit::AuditEntry;
pub use chargeback::{Chargeback, ChargebackStatus, DisputePage, RemoteDispute};
pub use gateway::{FailureCategory, GatewayApproval, GatewayFailure};
pub use idempotency::{BeginOutcome, IdempotencyRecord, IdempotencyState};
pub use money::{Amount, Currency};
pub use subscription::{FailureOption, Frequency, RetryDecision, Subscription, SubscriptionStatus};
pub use transaction::{RefundState, Transaction, TransactionKind, TransactionStatus};
pub use webhook::{DeliveryStatus, WebhookDelivery, WebhookEndpoint, WebhookEvent};
