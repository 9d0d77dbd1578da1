//! Header normalization rules
//!
//! A rule rewrites one header card before it participates in matching. For
//! a given card an exact rule (`current` equal to the header value) wins;
//! otherwise the card's default rule applies, including when the header
//! lacks the card entirely.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub id: i64,
    /// Header card name, upper case (`TELESCOP`, `INSTRUME`, ...)
    pub card: String,
    pub current: Option<String>,
    pub replacement: String,
    pub is_default: bool,
}

/// Apply `rules` to a card -> value map in place
pub fn apply_rules(cards: &mut BTreeMap<String, String>, rules: &[MappingRule]) {
    let mut by_card: BTreeMap<&str, Vec<&MappingRule>> = BTreeMap::new();
    for rule in rules {
        by_card.entry(rule.card.as_str()).or_default().push(rule);
    }

    for (card, card_rules) in by_card {
        let current = cards.get(card).map(|v| v.trim().to_string());

        let exact = current.as_deref().and_then(|value| {
            card_rules
                .iter()
                .find(|r| !r.is_default && r.current.as_deref() == Some(value))
        });
        let chosen = exact.or_else(|| card_rules.iter().find(|r| r.is_default));

        if let Some(rule) = chosen {
            cards.insert(card.to_string(), rule.replacement.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(card: &str, current: Option<&str>, replacement: &str, is_default: bool) -> MappingRule {
        MappingRule {
            id: 0,
            card: card.to_string(),
            current: current.map(str::to_string),
            replacement: replacement.to_string(),
            is_default,
        }
    }

    #[test]
    fn test_exact_rule_wins_over_default() {
        let rules = vec![
            rule("TELESCOP", Some("EQ6-R Pro v2.1"), "EQ6R", false),
            rule("TELESCOP", None, "Unknown scope", true),
        ];
        let mut cards = BTreeMap::from([("TELESCOP".to_string(), "EQ6-R Pro v2.1".to_string())]);
        apply_rules(&mut cards, &rules);
        assert_eq!(cards["TELESCOP"], "EQ6R");
    }

    #[test]
    fn test_default_applies_when_no_exact_rule() {
        let rules = vec![
            rule("INSTRUME", Some("ZWO ASI2600MM"), "ASI2600", false),
            rule("INSTRUME", None, "ASI2600", true),
        ];
        let mut cards = BTreeMap::from([("INSTRUME".to_string(), "asi2600mm pro".to_string())]);
        apply_rules(&mut cards, &rules);
        assert_eq!(cards["INSTRUME"], "ASI2600");

        let mut missing = BTreeMap::new();
        apply_rules(&mut missing, &rules);
        assert_eq!(missing["INSTRUME"], "ASI2600");
    }

    #[test]
    fn test_unrelated_cards_untouched() {
        let rules = vec![rule("FILTER", Some("Hydrogen"), "Ha", false)];
        let mut cards = BTreeMap::from([
            ("FILTER".to_string(), "OIII".to_string()),
            ("OBJECT".to_string(), "M31".to_string()),
        ]);
        apply_rules(&mut cards, &rules);
        assert_eq!(cards["FILTER"], "OIII");
        assert_eq!(cards["OBJECT"], "M31");
    }
}
