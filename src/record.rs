//! The business row replicated by the engine.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Invoice number used for the sentinel row written when an HQ document is
/// first provisioned, so consumers can tell "provisioned but empty" from
/// "not yet created".
pub const SEED_INVOICE_NO: &str = "__provisioned__";

/// A single sales ledger row.
///
/// Uniqueness is logical (by `invoice_no`), not structurally enforced;
/// unknown fields round-trip through `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub invoice_no: String,
    #[serde(default)]
    pub customer: String,
    #[serde(default)]
    pub item_name: String,
    #[serde(default)]
    pub qty: f64,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub posting_date: String,
    #[serde(default)]
    pub sales_team: String,
    #[serde(default)]
    pub hq: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Sentinel row seeded into a freshly provisioned HQ document.
    pub fn seed(team: &str, hq: &str) -> Self {
        Self {
            invoice_no: SEED_INVOICE_NO.to_string(),
            qty: 0.0,
            value: 0.0,
            posting_date: Utc::now().to_rfc3339(),
            sales_team: team.to_string(),
            hq: hq.to_string(),
            ..Default::default()
        }
    }

    pub fn is_seed(&self) -> bool {
        self.invoice_no == SEED_INVOICE_NO
    }
}
