//! The `.task` file codec boundary.
//!
//! Everything above this module treats `.task` content as opaque: the
//! repository hands strings in and gets [`Item`]s out. The concrete encoding
//! is pretty-printed JSON. On parse, the tree is normalized: stable step and
//! task-node ids are ensured and empty-tests auto-confirmation is re-derived.

use crate::core::error::{Result, TaskplaneError};
use crate::core::item::Item;
use crate::core::step::{ensure_tree_ids, normalize_tree_checkpoints};

/// Parse `.task` file content into an Item, normalizing the step tree.
pub fn parse(content: &str) -> Result<Item> {
    let mut item: Item = serde_json::from_str(content)?;
    ensure_tree_ids(&mut item.steps);
    normalize_tree_checkpoints(&mut item.steps);
    if item.tests.is_empty() && !item.checkpoints.tests.confirmed {
        item.checkpoints.tests.auto_confirmed = true;
    }
    if item.id.trim().is_empty() {
        return Err(TaskplaneError::Validation(
            "task file has no id".to_string(),
        ));
    }
    Ok(item)
}

/// Serialize an Item to `.task` file content.
pub fn serialize(item: &Item) -> Result<String> {
    let mut out = serde_json::to_string_pretty(item)?;
    out.push('\n');
    Ok(out)
}
