//! Total orders over resource version tokens
//!
//! Resource versions are opaque to the synchronizer, but every backend must
//! define and document a total order over them so that upserts are
//! monotonic per identity. Backends pick one of these orders.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Resource version ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrder {
    /// Decimal tokens compare by numeric value (of any length, without
    /// overflow). All decimal tokens sort before non-decimal tokens; the
    /// latter compare by length, then bytewise.
    #[default]
    NumericAware,
    /// Plain bytewise comparison
    Lexicographic,
}

impl VersionOrder {
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            VersionOrder::Lexicographic => a.as_bytes().cmp(b.as_bytes()),
            VersionOrder::NumericAware => numeric_aware(a, b),
        }
    }

    /// Whether `incoming` must replace `stored`
    pub fn is_newer(&self, incoming: &str, stored: &str) -> bool {
        self.compare(incoming, stored) == Ordering::Greater
    }

    /// Whether `incoming` is at least as new as `stored`
    pub fn is_at_least(&self, incoming: &str, stored: &str) -> bool {
        self.compare(incoming, stored) != Ordering::Less
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VersionOrder::NumericAware => "numeric_aware",
            VersionOrder::Lexicographic => "lexicographic",
        }
    }
}

fn is_decimal(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn numeric_aware(a: &str, b: &str) -> Ordering {
    match (is_decimal(a), is_decimal(b)) {
        (true, true) => {
            let a = a.trim_start_matches('0');
            let b = b.trim_start_matches('0');
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a
            .len()
            .cmp(&b.len())
            .then_with(|| a.as_bytes().cmp(b.as_bytes())),
    }
}
