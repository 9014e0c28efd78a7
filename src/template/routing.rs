//! Gateway Routing
//!
//! Decides which routing-table entries of a gateway fire for the current
//! process data. Evaluation is not first-match: every matching entry
//! contributes its target, so a gateway can branch to several nodes at once.

use log::debug;
use serde_json::Value;

use super::model::{ProcessData, RoutingEntry};

/// Returns the targets of every entry that matches `data`, in table order.
///
/// An entry matches when it is a default entry, or when `data[entry.data]`
/// equals `entry.value` as a string. Missing keys never match. `sequence`
/// does not influence the result. A target named by several matching
/// entries is returned once.
///
/// # Example
///
/// ```
/// use flowcore::template::{routing::evaluate, RoutingEntry};
/// use serde_json::json;
///
/// let entries = vec![
///     RoutingEntry::when("status", "approved", "A"),
///     RoutingEntry::when("status", "rejected", "B"),
///     RoutingEntry::otherwise("C"),
/// ];
/// let data = json!({"status": "approved"}).as_object().unwrap().clone();
///
/// assert_eq!(evaluate(&entries, &data), vec!["A", "C"]);
/// ```
pub fn evaluate(entries: &[RoutingEntry], data: &ProcessData) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();

    for entry in entries {
        if !matches(entry, data) {
            continue;
        }
        debug!(
            "Routing entry (seq {}) matched -> '{}'",
            entry.sequence, entry.target
        );
        if !targets.contains(&entry.target) {
            targets.push(entry.target.clone());
        }
    }

    targets
}

/// Returns true if a single entry fires for `data`.
pub fn matches(entry: &RoutingEntry, data: &ProcessData) -> bool {
    if entry.default {
        return true;
    }
    data.get(&entry.data)
        .and_then(as_route_string)
        .is_some_and(|value| value == entry.value)
}

/// Renders scalar values the way they are compared against routing values.
///
/// Nulls, arrays and objects have no string form and never match.
fn as_route_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> ProcessData {
        value.as_object().cloned().unwrap_or_default()
    }

    fn status_table() -> Vec<RoutingEntry> {
        vec![
            RoutingEntry::when("status", "approved", "A"),
            RoutingEntry::when("status", "rejected", "B"),
            RoutingEntry::otherwise("C"),
        ]
    }

    #[test]
    fn test_value_match_and_default_both_fire() {
        let targets = evaluate(&status_table(), &data(json!({"status": "approved"})));
        assert_eq!(targets, vec!["A", "C"]);
    }

    #[test]
    fn test_only_default_fires_for_unknown_value() {
        let targets = evaluate(&status_table(), &data(json!({"status": "pending"})));
        assert_eq!(targets, vec!["C"]);
    }

    #[test]
    fn test_missing_key_never_matches() {
        let entries = vec![RoutingEntry::when("flag", "", "D")];
        assert!(evaluate(&entries, &ProcessData::new()).is_empty());
    }

    #[test]
    fn test_no_match_without_default_is_empty() {
        let entries = vec![
            RoutingEntry::when("flag", "d", "D"),
            RoutingEntry::when("flag", "e", "E"),
        ];
        assert!(evaluate(&entries, &data(json!({"flag": "x"}))).is_empty());
    }

    #[test]
    fn test_scalar_values_compare_as_strings() {
        let entries = vec![
            RoutingEntry::when("approved", "true", "yes"),
            RoutingEntry::when("amount", "100", "big"),
        ];
        let targets = evaluate(&entries, &data(json!({"approved": true, "amount": 100})));
        assert_eq!(targets, vec!["yes", "big"]);
    }

    #[test]
    fn test_null_and_object_never_match() {
        let entries = vec![
            RoutingEntry::when("a", "null", "X"),
            RoutingEntry::when("b", "{}", "Y"),
        ];
        assert!(evaluate(&entries, &data(json!({"a": null, "b": {}}))).is_empty());
    }

    #[test]
    fn test_sequence_does_not_reorder() {
        let entries = vec![
            RoutingEntry::otherwise("late").with_sequence(9),
            RoutingEntry::otherwise("early").with_sequence(1),
        ];
        assert_eq!(evaluate(&entries, &ProcessData::new()), vec!["late", "early"]);
    }

    #[test]
    fn test_duplicate_targets_collapse() {
        let entries = vec![
            RoutingEntry::when("status", "approved", "A"),
            RoutingEntry::otherwise("A"),
        ];
        assert_eq!(evaluate(&entries, &data(json!({"status": "approved"}))), vec!["A"]);
    }
}
