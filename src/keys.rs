//! Cache key derivation
//!
//! Deterministic keys for collection reads. A key is a pure function of the
//! operation kind, the filter, and every query option that can change the
//! result set, so two logically identical reads always share one cache entry
//! and two different reads never do.
//!
//! Key shape:
//!
//! ```text
//! <prefix><op>-<filter>[-<options>][-sort<sort>][-skip<N>][-limit<N>]
//! ```
//!
//! Optional segments are emitted only when the parameter is supplied. The
//! `sort`, `skip`, and `limit` segments carry a literal label so that a
//! present-but-empty options document can never collide with a
//! present-but-empty sort document. `skip` and `limit` are `Option`s: a
//! supplied zero is a different key than an omitted parameter.

use std::fmt;

use bson::{Bson, Document};
use serde_json::Value;

use crate::store::FindSpec;

/// Read operation kind, used to tag cache keys so that `count`, `find`, and
/// `findOne` results for the same filter never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Count,
    Find,
    FindOne,
}

impl Operation {
    /// Key segment for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Count => "count",
            Operation::Find => "find",
            Operation::FindOne => "findOne",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the cache key for a read against one collection.
///
/// `prefix` namespaces the key per collection (see
/// [`SourceConfig`](crate::source::SourceConfig)); it already ends with the
/// segment separator. Pure: no I/O, no hidden state.
pub fn derive_key(
    prefix: &str,
    op: Operation,
    filter: &Document,
    find_options: Option<&FindSpec>,
    sort: Option<&Document>,
    skip: Option<u64>,
    limit: Option<i64>,
) -> String {
    let mut key = String::with_capacity(prefix.len() + 32);
    key.push_str(prefix);
    key.push_str(op.as_str());
    key.push('-');
    write_canonical(&document_to_value(filter), &mut key);

    if let Some(spec) = find_options {
        key.push('-');
        // FindSpec is a plain serde struct of documents; conversion cannot
        // fail in practice
        let value = serde_json::to_value(spec).unwrap_or(Value::Null);
        write_canonical(&value, &mut key);
    }
    if let Some(sort) = sort {
        key.push_str("-sort");
        write_canonical(&document_to_value(sort), &mut key);
    }
    if let Some(skip) = skip {
        key.push_str("-skip");
        key.push_str(&skip.to_string());
    }
    if let Some(limit) = limit {
        key.push_str("-limit");
        key.push_str(&limit.to_string());
    }

    key
}

fn document_to_value(doc: &Document) -> Value {
    Bson::Document(doc.clone()).into_relaxed_extjson()
}

/// Render JSON with object keys sorted recursively at every nesting level.
///
/// BSON documents preserve insertion order, and `serde_json` maps may do the
/// same when the `preserve_order` feature is enabled transitively, so
/// canonical ordering is enforced here rather than assumed from the map type.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
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
