//! Work item identity

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Identity of a work item: `(group_key, item_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    /// Group the item belongs to (the source sub-directory)
    pub group_key: String,
    /// Item identifier within its group (the source file name)
    pub item_id: String,
}

impl ItemKey {
    pub fn new(group_key: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_key, self.item_id)
    }
}

/// One unit of extraction work. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Group the item belongs to
    pub group_key: String,
    /// Item identifier within its group
    pub item_id: String,
    /// Where the source content lives
    pub source_ref: PathBuf,
    /// Source size at enumeration time
    pub size_bytes: u64,
}

impl WorkItem {
    pub fn new(
        group_key: impl Into<String>,
        item_id: impl Into<String>,
        source_ref: impl Into<PathBuf>,
        size_bytes: u64,
    ) -> Self {
        Self {
            group_key: group_key.into(),
            item_id: item_id.into(),
            source_ref: source_ref.into(),
            size_bytes,
        }
    }

    /// The item's identity
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.group_key.clone(), self.item_id.clone())
    }

    /// Stable enumeration order: group key, then item id
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.group_key
            .cmp(&other.group_key)
            .then_with(|| self.item_id.cmp(&other.item_id))
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_key, self.item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_group_then_item() {
        let a = WorkItem::new("10", "b.pdf", "/in/10/b.pdf", 1);
        let b = WorkItem::new("2", "a.pdf", "/in/2/a.pdf", 1);
        let c = WorkItem::new("10", "a.pdf", "/in/10/a.pdf", 1);

        let mut items = vec![a.clone(), b.clone(), c.clone()];
        items.sort_by(|x, y| x.cmp_order(y));
        assert_eq!(items, vec![c, a, b]);
    }

    #[test]
    fn test_key_display() {
        let item = WorkItem::new("123", "doc.pdf", "/in/123/doc.pdf", 10);
        assert_eq!(item.key().to_string(), "123/doc.pdf");
        assert_eq!(item.key(), ItemKey::new("123", "doc.pdf"));
    }
}
