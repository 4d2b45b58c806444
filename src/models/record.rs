use crate::error::{Result, SyncError};
use crate::models::SyncPeriod;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Data types a sync can be triggered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Merchants,
    Residuals,
    Volumes,
    All,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Merchants => "merchants",
            DataType::Residuals => "residuals",
            DataType::Volumes => "volumes",
            DataType::All => "all",
        }
    }

    /// Record kinds touched by a sync of this data type, in sync order
    pub fn record_kinds(&self) -> &'static [RecordKind] {
        match self {
            DataType::Merchants => &[RecordKind::Merchant],
            DataType::Residuals => &[RecordKind::Residual],
            DataType::Volumes => &[RecordKind::Transaction],
            DataType::All => &[
                RecordKind::Merchant,
                RecordKind::Transaction,
                RecordKind::Residual,
            ],
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merchants" => Ok(DataType::Merchants),
            "residuals" => Ok(DataType::Residuals),
            "volumes" | "transactions" => Ok(DataType::Volumes),
            "all" => Ok(DataType::All),
            other => Err(SyncError::validation(format!(
                "unknown data type '{other}' (expected merchants, residuals, volumes or all)"
            ))),
        }
    }
}

/// Kind of record served by the CRM API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Merchant,
    Transaction,
    Residual,
}

impl RecordKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            RecordKind::Merchant => "/merchants",
            RecordKind::Transaction => "/transactions",
            RecordKind::Residual => "/residuals",
        }
    }

    pub fn item_type(&self) -> &'static str {
        match self {
            RecordKind::Merchant => "merchant",
            RecordKind::Transaction => "transaction",
            RecordKind::Residual => "residual",
        }
    }

    /// Data type whose watermark this kind advances
    pub fn data_type(&self) -> DataType {
        match self {
            RecordKind::Merchant => DataType::Merchants,
            RecordKind::Transaction => DataType::Volumes,
            RecordKind::Residual => DataType::Residuals,
        }
    }

    pub fn is_monthly(&self) -> bool {
        !matches!(self, RecordKind::Merchant)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.item_type())
    }
}

/// Result of an idempotent upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored row already had the same content hash
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_change(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Keys the CRM has used for the merchant identifier
const MERCHANT_KEY_FIELDS: &[&str] = &["merchant_number", "merchantNumber", "mid", "merchant_id"];

/// A CRM record reduced to its natural key and an opaque payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmRecord {
    pub kind: RecordKind,
    pub natural_key: String,
    pub merchant_number: String,
    pub period: Option<SyncPeriod>,
    pub payload: Value,
    pub content_hash: String,
}

impl CrmRecord {
    /// Build a record from a CRM payload. Monthly kinds need a period, taken
    /// from the payload's `year`/`month` fields when present, else from `period`.
    pub fn from_payload(kind: RecordKind, payload: Value, period: Option<SyncPeriod>) -> Result<Self> {
        let merchant_number = MERCHANT_KEY_FIELDS
            .iter()
            .find_map(|field| match payload.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| {
                SyncError::validation(format!("{kind} record has no merchant identifier"))
            })?;

        let period = if kind.is_monthly() {
            let from_payload = match (
                payload.get("year").and_then(Value::as_i64),
                payload.get("month").and_then(Value::as_u64),
            ) {
                (Some(year), Some(month)) => i32::try_from(year)
                    .ok()
                    .and_then(|y| SyncPeriod::new(y, month as u32)),
                _ => None,
            };
            Some(from_payload.or(period).ok_or_else(|| {
                SyncError::validation(format!(
                    "{kind} record for merchant {merchant_number} has no period"
                ))
            })?)
        } else {
            None
        };

        Ok(Self::new(kind, merchant_number, period, payload))
    }

    pub fn new(kind: RecordKind, merchant_number: String, period: Option<SyncPeriod>, payload: Value) -> Self {
        let natural_key = match period {
            Some(p) if kind.is_monthly() => format!("{merchant_number}:{p}"),
            _ => merchant_number.clone(),
        };
        let content_hash = content_hash(&payload);
        Self {
            kind,
            natural_key,
            merchant_number,
            period,
            payload,
            content_hash,
        }
    }
}

/// Hex SHA-256 of the payload's canonical JSON (object keys sorted)
pub fn content_hash(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"merchant_number": "100", "dba": "Cafe", "status": "active"});
        let b = json!({"status": "active", "dba": "Cafe", "merchant_number": "100"});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"merchant_number": "100"})));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn test_monthly_records_key_on_period() {
        let record = CrmRecord::from_payload(
            RecordKind::Residual,
            json!({"mid": 4411, "net_residual": 12.5}),
            SyncPeriod::new(2024, 3),
        )
        .unwrap();
        assert_eq!(record.merchant_number, "4411");
        assert_eq!(record.natural_key, "4411:2024-03");

        let from_fields = CrmRecord::from_payload(
            RecordKind::Transaction,
            json!({"merchant_number": "77", "year": 2025, "month": 1}),
            None,
        )
        .unwrap();
        assert_eq!(from_fields.natural_key, "77:2025-01");
    }

    #[test]
    fn test_missing_identifier_is_validation_error() {
        let err = CrmRecord::from_payload(RecordKind::Merchant, json!({"dba": "x"}), None).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = CrmRecord::from_payload(RecordKind::Residual, json!({"mid": "1"}), None).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_data_type_parsing() {
        assert_eq!("volumes".parse::<DataType>().unwrap(), DataType::Volumes);
        assert_eq!("transactions".parse::<DataType>().unwrap(), DataType::Volumes);
        assert!("payouts".parse::<DataType>().is_err());
        assert_eq!(DataType::All.record_kinds().len(), 3);
    }
}
