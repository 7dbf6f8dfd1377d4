//! Billing integration for the Hanzo gateway.
//!
//! Wraps the commerce back end behind a TTL-cached client, a per-request
//! admission gate, and a best-effort usage reporter. The gate fails closed:
//! when commerce cannot answer, paid traffic is denied rather than admitted.

pub mod client;
pub mod gate;
pub mod usage;

pub use client::{BillingClient, BillingClientConfig, BillingError, SubscriptionStatus};
pub use gate::{check_billing_admission, BillingAdmission, BillingSubject};
pub use usage::{UsageRecord, UsageReporter, UsageSinkConfig, UsageTenant};
