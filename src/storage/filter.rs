//! Label and annotation predicates for list and watch queries
//!
//! Predicates arrive already parsed from the query layer. They serialize as
//! JSON with AND / OR / NOT combinators:
//!
//! ```json
//! {
//!   "AND": [
//!     {"key": "app", "operator": "in", "values": ["web", "api"]},
//!     {"scope": "annotation", "key": "team", "operator": "exists"},
//!     {"NOT": {"key": "tier", "operator": "equals", "values": ["canary"]}}
//!   ]
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynchroError};
use crate::types::ResourceRecord;

/// A predicate evaluated against a record's labels and annotations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Predicate {
    /// Logical AND of multiple predicates
    And {
        #[serde(rename = "AND")]
        conditions: Vec<Predicate>,
    },
    /// Logical OR of multiple predicates
    Or {
        #[serde(rename = "OR")]
        conditions: Vec<Predicate>,
    },
    /// Negation
    Not {
        #[serde(rename = "NOT")]
        condition: Box<Predicate>,
    },
    /// A single key requirement
    Requirement(Requirement),
}

/// Which metadata map a requirement looks at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectorScope {
    #[default]
    Label,
    Annotation,
}

/// Requirement operator, with Kubernetes selector semantics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectorOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One key requirement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    #[serde(default)]
    pub scope: SelectorScope,
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn label(key: impl Into<String>, operator: SelectorOperator, values: &[&str]) -> Self {
        Self {
            scope: SelectorScope::Label,
            key: key.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn annotation(key: impl Into<String>, operator: SelectorOperator, values: &[&str]) -> Self {
        Self {
            scope: SelectorScope::Annotation,
            ..Self::label(key, operator, values)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(SynchroError::RecordInvalid(
                "selector key cannot be empty".to_string(),
            ));
        }
        let arity_ok = match self.operator {
            SelectorOperator::Equals | SelectorOperator::NotEquals => self.values.len() == 1,
            SelectorOperator::In | SelectorOperator::NotIn => !self.values.is_empty(),
            SelectorOperator::Exists | SelectorOperator::DoesNotExist => self.values.is_empty(),
        };
        if !arity_ok {
            return Err(SynchroError::RecordInvalid(format!(
                "selector operator {:?} on '{}' has {} values",
                self.operator,
                self.key,
                self.values.len()
            )));
        }
        Ok(())
    }

    fn matches_map(&self, map: &BTreeMap<String, String>) -> bool {
        let value = map.get(&self.key);
        match self.operator {
            SelectorOperator::Equals => value == self.values.first(),
            // Absent keys satisfy negative operators
            SelectorOperator::NotEquals => value != self.values.first(),
            SelectorOperator::In => value.map(|v| self.values.contains(v)).unwrap_or(false),
            SelectorOperator::NotIn => value.map(|v| !self.values.contains(v)).unwrap_or(true),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl Predicate {
    /// Predicate requiring every label to have the given value
    pub fn labels_equal<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Predicate::And {
            conditions: labels
                .into_iter()
                .map(|(k, v)| {
                    Predicate::Requirement(Requirement::label(k, SelectorOperator::Equals, &[v]))
                })
                .collect(),
        }
    }

    /// Parse a predicate from its JSON form
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let predicate: Predicate = serde_json::from_value(value.clone())
            .map_err(|e| SynchroError::RecordInvalid(format!("invalid predicate: {}", e)))?;
        predicate.validate()?;
        Ok(predicate)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::And { conditions } | Predicate::Or { conditions } => {
                conditions.iter().try_for_each(Predicate::validate)
            }
            Predicate::Not { condition } => condition.validate(),
            Predicate::Requirement(req) => req.validate(),
        }
    }

    pub fn matches(&self, record: &ResourceRecord) -> bool {
        match self {
            Predicate::And { conditions } => conditions.iter().all(|c| c.matches(record)),
            Predicate::Or { conditions } => conditions.iter().any(|c| c.matches(record)),
            Predicate::Not { condition } => !condition.matches(record),
            Predicate::Requirement(req) => match req.scope {
                SelectorScope::Label => req.matches_map(&record.labels),
                SelectorScope::Annotation => req.matches_map(&record.annotations),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupVersionKind;
    use chrono::Utc;
    use serde_json::json;

    fn record(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ResourceRecord {
        ResourceRecord {
            cluster: "c".to_string(),
            gvk: GroupVersionKind::new("", "v1", "Pod"),
            resource: "pods".to_string(),
            namespace: Some("default".to_string()),
            name: "p".to_string(),
            uid: None,
            resource_version: "1".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: None,
            last_seen: Utc::now(),
            payload: json!({}),
            deleted: false,
        }
    }

    #[test]
    fn test_operators() {
        let r = record(&[("app", "web"), ("tier", "prod")], &[]);
        let check = |op, values: &[&str], key: &str| {
            Predicate::Requirement(Requirement::label(key, op, values)).matches(&r)
        };

        assert!(check(SelectorOperator::Equals, &["web"], "app"));
        assert!(!check(SelectorOperator::Equals, &["api"], "app"));
        assert!(check(SelectorOperator::NotEquals, &["api"], "app"));
        assert!(check(SelectorOperator::NotEquals, &["x"], "missing"));
        assert!(check(SelectorOperator::In, &["api", "web"], "app"));
        assert!(!check(SelectorOperator::In, &["api"], "missing"));
        assert!(check(SelectorOperator::NotIn, &["dev"], "tier"));
        assert!(check(SelectorOperator::NotIn, &["dev"], "missing"));
        assert!(check(SelectorOperator::Exists, &[], "tier"));
        assert!(check(SelectorOperator::DoesNotExist, &[], "missing"));
    }

    #[test]
    fn test_parse_nested_json() {
        let predicate = Predicate::from_json(&json!({
            "AND": [
                {"key": "app", "operator": "in", "values": ["web", "api"]},
                {"scope": "annotation", "key": "team", "operator": "exists"},
                {"NOT": {"key": "tier", "operator": "equals", "values": ["canary"]}}
            ]
        }))
        .unwrap();

        assert!(predicate.matches(&record(&[("app", "web")], &[("team", "infra")])));
        assert!(!predicate.matches(&record(&[("app", "web")], &[])));
        assert!(!predicate.matches(&record(
            &[("app", "api"), ("tier", "canary")],
            &[("team", "infra")]
        )));
    }

    #[test]
    fn test_or() {
        let predicate = Predicate::from_json(&json!({
            "OR": [
                {"key": "app", "operator": "equals", "values": ["web"]},
                {"key": "app", "operator": "equals", "values": ["api"]}
            ]
        }))
        .unwrap();
        assert!(predicate.matches(&record(&[("app", "api")], &[])));
        assert!(!predicate.matches(&record(&[("app", "db")], &[])));
    }

    #[test]
    fn test_invalid_arity_rejected() {
        let result = Predicate::from_json(&json!({"key": "app", "operator": "equals"}));
        assert!(result.is_err());
        let result = Predicate::from_json(
            &json!({"key": "app", "operator": "exists", "values": ["x"]}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_labels_equal_builder() {
        let predicate = Predicate::labels_equal([("app", "web")]);
        assert!(predicate.matches(&record(&[("app", "web"), ("x", "y")], &[])));
        assert!(!predicate.matches(&record(&[], &[])));
    }
}
