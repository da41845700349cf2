//! Hierarchical resource names.

use std::fmt;

/// An immutable path identifying one node of the resource hierarchy
/// (database → table → page → row).
///
/// Names are non-empty ordered segment sequences; equality and hashing are
/// structural. Descendant-of is a *strict* prefix test: a name is never a
/// descendant of itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceName {
    segments: Vec<String>,
}

impl ResourceName {
    /// A top-level (single-segment) name.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            segments: vec![root.into()],
        }
    }

    /// Extend this name by one segment.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The name one level up, or `None` at a top-level name.
    #[must_use]
    pub fn parent(&self) -> Option<ResourceName> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True iff `ancestor`'s segments are a strict prefix of this name's.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &ResourceName) -> bool {
        ancestor.segments.len() < self.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    /// The path segments, root first. Never empty.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment.
    #[must_use]
    pub fn leaf(&self) -> &str {
        // Construction guarantees at least one segment.
        self.segments.last().map_or("", String::as_str)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendant_is_strict_prefix() {
        let db = ResourceName::new("database");
        let table = db.child("users");
        let page = table.child("3");

        assert!(table.is_descendant_of(&db));
        assert!(page.is_descendant_of(&db));
        assert!(page.is_descendant_of(&table));
        assert!(!db.is_descendant_of(&db));
        assert!(!db.is_descendant_of(&table));
        assert!(!table.is_descendant_of(&page));
    }

    #[test]
    fn sibling_names_are_unrelated() {
        let db = ResourceName::new("database");
        let users = db.child("users");
        let orders = db.child("orders");
        assert!(!users.is_descendant_of(&orders));
        assert!(!orders.is_descendant_of(&users));
        assert_ne!(users, orders);
    }

    #[test]
    fn parent_walks_to_root() {
        let page = ResourceName::new("database").child("users").child("3");
        let table = page.parent().unwrap();
        assert_eq!(table, ResourceName::new("database").child("users"));
        let db = table.parent().unwrap();
        assert_eq!(db, ResourceName::new("database"));
        assert_eq!(db.parent(), None);
    }

    #[test]
    fn display_joins_segments() {
        let page = ResourceName::new("database").child("users").child("3");
        assert_eq!(page.to_string(), "database/users/3");
        assert_eq!(page.leaf(), "3");
    }
}
