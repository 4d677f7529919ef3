//! Flattening of a detail row plus its embedded document into the output
//! record shape.
//!
//! Projection is total: whatever the embedded JSON looks like (absent,
//! malformed, or any subset of the expected shape), the scalar detail
//! columns always survive and the JSON-derived fields degrade to empty.

use chrono::NaiveDateTime;
use master_db::DetailRow;
use rust_decimal::Decimal;

use crate::transaction::TransactionData;

/// The flat output record: scalar detail columns plus the projected fields
/// of the embedded transaction document.
#[derive(Debug, Clone, Default)]
pub struct FlatRecord {
    pub detail_id: i64,
    pub account_number: Option<String>,
    pub customer_name: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub transaction_date: Option<NaiveDateTime>,

    pub transaction_id: Option<String>,
    pub transaction_type: Option<String>,

    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_city: Option<String>,
    pub customer_state: Option<String>,
    pub customer_country: Option<String>,

    pub merchant_id: Option<String>,
    pub merchant_name: Option<String>,
    pub merchant_category: Option<String>,

    pub payment_type: Option<String>,
    pub payment_last_four: Option<String>,
    pub payment_brand: Option<String>,

    pub risk_score: Option<f64>,
    pub status: Option<String>,

    /// Length of the items array, when the document carries one.
    pub item_count: Option<usize>,

    /// Whether the embedded document was present but failed to deserialize.
    /// Such rows are still written; the failure is only counted.
    pub json_error: bool,
}

/// Project a detail row to its flat output record.
pub fn project(row: DetailRow) -> FlatRecord {
    let (document, json_error) = match row.transaction_data.as_deref() {
        None => (None, false),
        Some(raw) => match TransactionData::parse(raw) {
            Ok(document) => (document, false),
            Err(err) => {
                tracing::warn!(
                    detail_id = row.detail_id,
                    error = %err,
                    "unparseable embedded transaction document, writing row with empty fields"
                );
                (None, true)
            }
        },
    };

    let mut record = FlatRecord {
        detail_id: row.detail_id,
        account_number: row.account_number,
        customer_name: row.customer_name,
        amount: row.amount,
        currency: row.currency,
        description: row.description,
        transaction_date: row.transaction_date,
        json_error,
        ..Default::default()
    };

    let Some(document) = document else {
        return record;
    };

    record.transaction_id = document.transaction_id;
    record.transaction_type = document.transaction_type;
    record.risk_score = document.risk_score;
    record.status = document.status;
    record.item_count = document.items.as_ref().map(|items| items.len());

    if let Some(customer) = document.customer {
        record.customer_id = customer.customer_id;
        record.customer_email = customer.email;
        record.customer_phone = customer.phone;
        if let Some(address) = customer.address {
            record.customer_city = address.city;
            record.customer_state = address.state;
            record.customer_country = address.country;
        }
    }

    if let Some(merchant) = document.merchant {
        record.merchant_id = merchant.merchant_id;
        record.merchant_name = merchant.name;
        record.merchant_category = merchant.category;
    }

    if let Some(payment) = document.payment_method {
        record.payment_type = payment.kind;
        record.payment_last_four = payment.last_four;
        record.payment_brand = payment.brand;
    }

    record
}
