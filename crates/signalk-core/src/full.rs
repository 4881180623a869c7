//! Full-tree snapshot builder.
//!
//! Turns a flat list of latest readings into the hierarchical SignalK
//! document served by the REST API:
//!
//! ```text
//! { "version": "...", "self": "vessels.x",
//!   "vessels": { "x": { "navigation": { "speedOverGround": {
//!       "value": 3.6, "timestamp": "...", "source": {"label": "...", "type": "..."} } } } } }
//! ```

use serde_json::{Map, Value};

use crate::model::SingleValueMapped;
use crate::path::{segments, split_context};

/// Build the Full tree from latest-per-(context, path) rows.
pub fn build_full_tree(rows: &[SingleValueMapped], self_context: &str, version: &str) -> Value {
    let mut root = Map::new();

    for row in rows {
        let (kind, id) = split_context(&row.context);
        let mut node = child_object(&mut root, kind);
        if let Some(id) = id {
            node = child_object(node, id);
        }

        let parts: Vec<&str> = segments(&row.path).collect();
        let Some((leaf, branches)) = parts.split_last() else {
            continue;
        };
        for branch in branches {
            node = child_object(node, branch);
        }

        let leaf_value = serde_json::json!({
            "value": row.value,
            "timestamp": row.timestamp,
            "source": {
                "label": row.source.label,
                "type": row.source.source_type,
            },
        });
        merge_leaf(node, leaf, leaf_value);
    }

    root.insert("version".to_string(), Value::String(version.to_string()));
    root.insert("self".to_string(), Value::String(self_context.to_string()));
    Value::Object(root)
}

/// Descend into `key`, replacing any non-object already stored there.
fn child_object<'a>(node: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = node
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("entry was just made an object"),
    }
}

// A leaf may share its key with a branch ("a.b" and "a.b.c"); keep both by
// merging the leaf fields into the existing object.
fn merge_leaf(node: &mut Map<String, Value>, key: &str, leaf: Value) {
    match (node.get_mut(key), leaf) {
        (Some(Value::Object(existing)), Value::Object(fields)) => {
            for (k, v) in fields {
                existing.insert(k, v);
            }
        }
        (_, leaf) => {
            node.insert(key.to_string(), leaf);
        }
    }
}
