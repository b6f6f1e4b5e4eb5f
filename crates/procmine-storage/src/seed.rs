// Default ontology seeding
//
// First startup installs the default object types and a small set of seed
// extraction rules. Seeding is idempotent: existing types and seed rules
// are left alone.

use chrono::Utc;
use procmine_core::error::Result;
use procmine_core::objects::DEFAULT_OBJECT_TYPES;
use procmine_core::rules::{ExtractionRule, RuleProvenance};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::CreateObjectType;
use crate::repositories::Database;

/// Install missing default object types and seed rules
pub async fn seed_defaults(db: &Database) -> Result<()> {
    for (name, display_name) in DEFAULT_OBJECT_TYPES {
        if db.get_object_type_by_name(name).await?.is_none() {
            db.create_object_type(CreateObjectType {
                name: name.to_string(),
                display_name: display_name.to_string(),
                schema: None,
                icon: None,
                color: None,
            })
            .await?;
        }
    }

    let existing_seeds: Vec<String> = db
        .list_rules(false)
        .await?
        .into_iter()
        .filter(|r| r.provenance == "seed")
        .map(|r| r.name)
        .collect();

    for rule in seed_rules() {
        if !existing_seeds.contains(&rule.name) {
            db.create_rule(&rule).await?;
        }
    }
    Ok(())
}

fn seed_rule(
    name: &str,
    object_type: &str,
    pattern: &str,
    template: &str,
    mapping: &[(&str, &str)],
    priority: i32,
    confidence: f64,
) -> ExtractionRule {
    let now = Utc::now();
    ExtractionRule {
        id: Uuid::now_v7(),
        name: name.to_string(),
        object_type: object_type.to_string(),
        source_fields: vec!["title".to_string(), "url".to_string(), "ocr_text".to_string()],
        pattern: pattern.to_string(),
        name_template: template.to_string(),
        data_mapping: mapping
            .iter()
            .map(|(group, key)| (group.to_string(), key.to_string()))
            .collect::<BTreeMap<_, _>>(),
        enabled: true,
        priority,
        provenance: RuleProvenance::Seed,
        match_count: 0,
        confirm_count: 0,
        reject_count: 0,
        confidence,
        created_at: now,
        updated_at: now,
    }
}

fn seed_rules() -> Vec<ExtractionRule> {
    vec![
        seed_rule(
            "purchase order numbers",
            "purchase_order",
            r"(?:Purchase Order|PO)\s*(?P<po_number>PO-\d{4}-\d{6})",
            "{po_number}",
            &[("po_number", "po_number")],
            100,
            0.9,
        ),
        seed_rule(
            "invoice numbers",
            "invoice",
            r"\b(?P<invoice_number>INV[-/]\d{3,10})\b",
            "{invoice_number}",
            &[("invoice_number", "invoice_number")],
            90,
            0.85,
        ),
        seed_rule(
            "sales order numbers",
            "order",
            r"\b(?P<order_number>SO-\d{3,10})\b",
            "{order_number}",
            &[("order_number", "order_number")],
            90,
            0.85,
        ),
        seed_rule(
            "product SKUs",
            "product",
            r"\b(?P<sku>SKU-\d{4,8})\b",
            "{sku}",
            &[("sku", "sku")],
            70,
            0.8,
        ),
        seed_rule(
            "customer emails",
            "customer",
            r"(?P<email>[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,})",
            "{email}",
            &[("email", "email")],
            40,
            0.6,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmine_core::rules::CompiledRule;

    #[test]
    fn test_seed_rules_compile() {
        for rule in seed_rules() {
            CompiledRule::compile(rule).expect("seed rule must compile");
        }
    }

    #[tokio::test]
    async fn test_seeding_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        seed_defaults(&db).await.unwrap();
        let types_first = db.list_object_types().await.unwrap().len();
        let rules_first = db.list_rules(false).await.unwrap().len();

        seed_defaults(&db).await.unwrap();
        assert_eq!(db.list_object_types().await.unwrap().len(), types_first);
        assert_eq!(db.list_rules(false).await.unwrap().len(), rules_first);
        assert_eq!(types_first, 9);
        assert_eq!(rules_first, 5);
    }
}
