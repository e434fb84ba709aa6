//! Projection of raw order documents into canonical customers.

use custrecon_core::{CanonicalCustomer, RawDocument};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("document has no source body")]
    MissingSource,
    #[error("missing customer_id")]
    MissingCustomerId,
    #[error("customer_id is not numeric")]
    CustomerIdNotNumeric,
    #[error("missing email")]
    MissingEmail,
    #[error("email is not a string")]
    EmailNotString,
    #[error("blank email")]
    BlankEmail,
}

/// Validate one source document and project it into a [`CanonicalCustomer`].
///
/// Non-integral ids are truncated toward zero. `customer_phone` falls back to
/// an empty string only when the field is absent; every other descriptive
/// field is copied as-is, with absent values becoming `null`.
pub fn normalize(raw: &RawDocument) -> Result<CanonicalCustomer, RejectReason> {
    let source = raw.source.as_ref().ok_or(RejectReason::MissingSource)?;

    let customer_id = match source.get("customer_id") {
        None | Some(JsonValue::Null) => return Err(RejectReason::MissingCustomerId),
        Some(value) => coerce_customer_id(value).ok_or(RejectReason::CustomerIdNotNumeric)?,
    };

    let email = match source.get("email") {
        None | Some(JsonValue::Null) => return Err(RejectReason::MissingEmail),
        Some(JsonValue::String(email)) => email,
        Some(_) => return Err(RejectReason::EmailNotString),
    };
    if email.trim().is_empty() {
        return Err(RejectReason::BlankEmail);
    }

    let passthrough = |name: &str| source.get(name).cloned().unwrap_or(JsonValue::Null);

    Ok(CanonicalCustomer {
        customer_id,
        email: email.clone(),
        customer_full_name: passthrough("customer_full_name"),
        customer_first_name: passthrough("customer_first_name"),
        customer_last_name: passthrough("customer_last_name"),
        customer_gender: passthrough("customer_gender"),
        customer_phone: source
            .get("customer_phone")
            .cloned()
            .unwrap_or_else(|| JsonValue::String(String::new())),
        user: passthrough("user"),
    })
}

fn coerce_customer_id(value: &JsonValue) -> Option<i64> {
    let JsonValue::Number(number) = value else {
        return None;
    };
    if let Some(id) = number.as_i64() {
        return Some(id);
    }
    // Floats and out-of-range unsigned values: `as` truncates toward zero and saturates.
    number.as_f64().map(|id| id.trunc() as i64)
}
