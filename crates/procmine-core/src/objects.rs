// Business object entities
//
// Objects are the nouns of a discovered process (orders, invoices,
// customers). They are globally shared; (type, name) is unique and the
// extractor deduplicates on that pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-defined category of business object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ObjectType {
    pub id: Uuid,
    /// Stable name, e.g. "purchase_order"
    pub name: String,
    pub display_name: String,
    /// Optional JSON schema for the `data` mapping of instances
    pub schema: Option<serde_json::Value>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A concrete business object instance, e.g. PO-2024-001234
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BusinessObject {
    pub id: Uuid,
    /// References ObjectType by stable name
    pub object_type: String,
    /// Human-readable identifier, unique within the type
    pub name: String,
    /// Type-specific fields
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Seeded default object types: (stable name, display name)
pub const DEFAULT_OBJECT_TYPES: &[(&str, &str)] = &[
    ("purchase_order", "Purchase Order"),
    ("order", "Order"),
    ("invoice", "Invoice"),
    ("shipment", "Shipment"),
    ("product", "Product"),
    ("customer", "Customer"),
    ("supplier", "Supplier"),
    ("task", "Task"),
    ("ledger_entry", "Ledger Entry"),
];

/// Provenance of an event-object link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkProvenance {
    /// Produced by an extraction rule
    Rule(Uuid),
    /// Produced by LLM enrichment
    Llm,
    /// Created or confirmed by the user
    Manual,
}

impl LinkProvenance {
    /// Wire encoding: "rule:<uuid>" | "llm" | "manual"
    pub fn encode(&self) -> String {
        match self {
            LinkProvenance::Rule(id) => format!("rule:{id}"),
            LinkProvenance::Llm => "llm".to_string(),
            LinkProvenance::Manual => "manual".to_string(),
        }
    }

    /// Parse the wire encoding; unknown strings are treated as manual
    pub fn decode(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix("rule:") {
            if let Ok(id) = rest.parse() {
                return LinkProvenance::Rule(id);
            }
        }
        match s {
            "llm" => LinkProvenance::Llm,
            _ => LinkProvenance::Manual,
        }
    }

    /// The rule id, when rule-derived
    pub fn rule_id(&self) -> Option<Uuid> {
        match self {
            LinkProvenance::Rule(id) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_round_trip() {
        let id = Uuid::now_v7();
        let p = LinkProvenance::Rule(id);
        assert_eq!(LinkProvenance::decode(&p.encode()), p);
        assert_eq!(LinkProvenance::decode("llm"), LinkProvenance::Llm);
        assert_eq!(LinkProvenance::decode("manual"), LinkProvenance::Manual);
    }

    #[test]
    fn test_default_types_include_purchase_order() {
        assert!(DEFAULT_OBJECT_TYPES.iter().any(|(n, _)| *n == "purchase_order"));
        assert_eq!(DEFAULT_OBJECT_TYPES.len(), 9);
    }
}
