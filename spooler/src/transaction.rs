//! Embedded transaction document
//!
//! Mirrors the JSON stored in `detail_records.transaction_data`. The document
//! is strictly tree-shaped; every nested object and the items array are
//! optional, and unknown fields are ignored, so any subset of the shape
//! deserializes cleanly.

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionData {
    pub transaction_id: Option<String>,
    pub transaction_type: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub timestamp: Option<String>,
    pub customer: Option<Customer>,
    pub merchant: Option<Merchant>,
    pub payment_method: Option<PaymentMethod>,
    pub items: Option<Vec<LineItem>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub risk_score: Option<f64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Customer {
    pub customer_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<Address>,
    pub loyalty_tier: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Merchant {
    pub merchant_id: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    /// Merchant Category Code
    pub mcc: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentMethod {
    /// CREDIT_CARD, DEBIT_CARD, BANK_TRANSFER, etc.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub last_four: Option<String>,
    /// VISA, MASTERCARD, AMEX, etc.
    pub brand: Option<String>,
    pub expiry_month: Option<i32>,
    pub expiry_year: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItem {
    pub item_id: Option<String>,
    pub name: Option<String>,
    pub quantity: Option<i64>,
    pub unit_price: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub category: Option<String>,
}

impl TransactionData {
    /// Deserialize a document from its raw JSON text.
    ///
    /// A JSON `null` is treated like an absent document, matching the store's
    /// NULL column semantics.
    pub fn parse(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_document_deserializes() {
        let raw = serde_json::json!({
            "transaction_id": "TXN-1",
            "transaction_type": "PURCHASE",
            "amount": "99.95",
            "currency": "USD",
            "customer": {
                "customer_id": "CUST-7",
                "email": "a@b.example",
                "address": { "city": "Boston", "state": "MA", "country": "US" },
            },
            "merchant": { "merchant_id": "M-1", "name": "Acme", "category": "RETAIL", "mcc": "5311" },
            "payment_method": { "type": "CREDIT_CARD", "last_four": "4242", "brand": "VISA" },
            "items": [{ "item_id": "I-1", "quantity": 2 }, {}],
            "metadata": { "channel": "web" },
            "risk_score": 12.5,
            "status": "COMPLETED",
        })
        .to_string();

        let doc = TransactionData::parse(&raw)
            .expect("document should deserialize")
            .expect("document should be present");

        assert_eq!(doc.transaction_id.as_deref(), Some("TXN-1"));
        assert_eq!(
            doc.customer.as_ref().unwrap().customer_id.as_deref(),
            Some("CUST-7")
        );
        assert_eq!(
            doc.customer
                .unwrap()
                .address
                .unwrap()
                .city
                .as_deref(),
            Some("Boston")
        );
        assert_eq!(
            doc.payment_method.unwrap().kind.as_deref(),
            Some("CREDIT_CARD")
        );
        assert_eq!(doc.items.unwrap().len(), 2);
        assert_eq!(doc.risk_score, Some(12.5));
    }

    #[test]
    fn empty_object_deserializes_to_all_none() {
        let doc = TransactionData::parse("{}")
            .expect("empty object should deserialize")
            .expect("document should be present");

        assert!(doc.transaction_id.is_none());
        assert!(doc.customer.is_none());
        assert!(doc.items.is_none());
    }

    #[test]
    fn json_null_is_an_absent_document() {
        let doc = TransactionData::parse("null").expect("null should deserialize");
        assert!(doc.is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{ "transaction_id": "T", "some_future_field": { "a": 1 } }"#;
        let doc = TransactionData::parse(raw)
            .expect("unknown fields should be ignored")
            .expect("document should be present");
        assert_eq!(doc.transaction_id.as_deref(), Some("T"));
    }

    #[test]
    fn non_object_document_is_an_error() {
        assert!(TransactionData::parse(r#""not a transaction""#).is_err());
        assert!(TransactionData::parse("[1, 2, 3]").is_err());
        assert!(TransactionData::parse("definitely not json").is_err());
    }
}
