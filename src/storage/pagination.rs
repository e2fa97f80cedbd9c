//! Keyset pagination shared by the backends
//!
//! Pages are cut on the sort key of the last returned row, never on an
//! offset, so a fixed data set is paged without gaps or duplicates. Every
//! sort key ends with (namespace, name), which is unique within one
//! (cluster, resource type) scope.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::backend::{ListOptions, ListPage, SortField, SortOrder};
use crate::error::{Result, SynchroError};
use crate::types::ResourceRecord;

/// Upper bound on a single page
pub const MAX_PAGE_SIZE: usize = 5000;

/// Decoded continue token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueToken {
    pub sort: SortField,
    pub order: SortOrder,
    /// Storage revision the first page was served at
    pub revision: String,
    pub key: Vec<String>,
}

impl ContinueToken {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| SynchroError::RecordInvalid(format!("malformed continue token: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SynchroError::RecordInvalid(format!("malformed continue token: {}", e)))
    }
}

/// Sort key of a record under the given field
pub fn sort_key(record: &ResourceRecord, field: SortField) -> Vec<String> {
    let namespace = record.namespace_key().to_string();
    let name = record.name.clone();
    match field {
        SortField::Name => vec![name, namespace],
        SortField::Namespace => vec![namespace, name],
        SortField::CreatedAt => vec![
            record
                .created_at
                .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string())
                .unwrap_or_default(),
            namespace,
            name,
        ],
        SortField::LastSeen => vec![
            record.last_seen.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string(),
            namespace,
            name,
        ],
        SortField::ResourceVersion => {
            vec![version_sort_key(&record.resource_version), namespace, name]
        }
    }
}

/// String key whose byte order matches `VersionOrder::NumericAware`
fn version_sort_key(version: &str) -> String {
    let is_decimal = !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit());
    if is_decimal {
        let trimmed = version.trim_start_matches('0');
        format!("0{:08}{}", trimmed.len(), trimmed)
    } else {
        format!("1{:08}{}", version.len(), version)
    }
}

/// Filter, sort and cut one page out of the candidate records
///
/// `candidates` must already be narrowed to one (cluster, resource type) and
/// exclude tombstones; namespace and predicate filters are applied here.
pub fn paginate(
    candidates: Vec<ResourceRecord>,
    options: &ListOptions,
    revision: &str,
) -> Result<ListPage> {
    let sort = options.sort_by;
    let order = options.sort_order;

    let cursor = match options.continue_token.as_deref() {
        Some(raw) => {
            let token = ContinueToken::decode(raw)?;
            if token.sort != sort || token.order != order {
                return Err(SynchroError::RecordInvalid(
                    "continue token was issued for a different sort".to_string(),
                ));
            }
            Some(token)
        }
        None => None,
    };

    if let Some(predicate) = &options.predicate {
        predicate.validate()?;
    }

    let mut rows: Vec<(Vec<String>, ResourceRecord)> = candidates
        .into_iter()
        .filter(|r| !r.deleted)
        .filter(|r| match &options.namespace {
            Some(ns) => r.namespace.as_deref() == Some(ns.as_str()),
            None => true,
        })
        .filter(|r| options.predicate.as_ref().map_or(true, |p| p.matches(r)))
        .map(|r| (sort_key(&r, sort), r))
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0));
    if order == SortOrder::Desc {
        rows.reverse();
    }

    if let Some(cursor) = &cursor {
        rows.retain(|(key, _)| match order {
            SortOrder::Asc => *key > cursor.key,
            SortOrder::Desc => *key < cursor.key,
        });
    }

    let limit = options
        .limit
        .filter(|l| *l > 0)
        .map(|l| l.min(MAX_PAGE_SIZE))
        .unwrap_or(usize::MAX);

    let total = rows.len();
    let has_more = total > limit;
    rows.truncate(limit);

    let page_revision = cursor
        .map(|c| c.revision)
        .unwrap_or_else(|| revision.to_string());

    let continue_token = match (has_more, rows.last()) {
        (true, Some((key, _))) => Some(
            ContinueToken {
                sort,
                order,
                revision: page_revision.clone(),
                key: key.clone(),
            }
            .encode()?,
        ),
        _ => None,
    };

    let returned = rows.len();
    Ok(ListPage {
        items: rows.into_iter().map(|(_, r)| r).collect(),
        continue_token,
        remaining_item_count: has_more.then(|| (total - returned) as u64),
        revision: page_revision,
    })
}
