//! Per-request billing admission.
//!
//! Personal mode (no billing client or no tenant) always admits. Otherwise a
//! positive prepaid balance admits, an active subscription admits, and
//! everything else is denied. Commerce failures deny: the prepaid balance is
//! the primary gate, so this path fails closed.

use tracing::warn;

use crate::client::{BillingClient, BillingError};

pub const BILLING_UNAVAILABLE_MESSAGE: &str = "Billing service unavailable — please try again";

#[derive(Debug, Clone, PartialEq, Eq)]
/// The billed parties for one request.
pub struct BillingSubject<'a> {
    pub org_id: &'a str,
    pub user_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Admission decision for one request.
pub enum BillingAdmission {
    Allowed,
    Denied { reason: String, status: u16 },
}

impl BillingAdmission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(reason: String) -> Self {
        Self::Denied {
            reason,
            status: 402,
        }
    }
}

/// Combines balance and subscription signals into an admission decision.
pub async fn check_billing_admission(
    client: Option<&BillingClient>,
    subject: Option<BillingSubject<'_>>,
    token: Option<&str>,
) -> BillingAdmission {
    let (Some(client), Some(subject)) = (client, subject) else {
        return BillingAdmission::Allowed;
    };

    match admission_from_commerce(client, &subject, token).await {
        Ok(admission) => admission,
        Err(error) => {
            warn!(org_id = subject.org_id, "billing gate failed closed: {error}");
            BillingAdmission::denied(BILLING_UNAVAILABLE_MESSAGE.to_string())
        }
    }
}

async fn admission_from_commerce(
    client: &BillingClient,
    subject: &BillingSubject<'_>,
    token: Option<&str>,
) -> Result<BillingAdmission, BillingError> {
    let balance = client.get_balance(subject.user_id, token).await?;
    if balance > 0 {
        return Ok(BillingAdmission::Allowed);
    }
    let subscription = client
        .get_subscription_status(subject.org_id, token)
        .await?;
    if subscription.active {
        return Ok(BillingAdmission::Allowed);
    }
    Ok(BillingAdmission::denied(format!(
        "Insufficient funds — add credits to continue. Balance: {}",
        format_cents_as_dollars(balance)
    )))
}

/// Formats integer cents as `$X.YY`.
fn format_cents_as_dollars(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let magnitude = cents.unsigned_abs();
    format!("{sign}${}.{:02}", magnitude / 100, magnitude % 100)
}
