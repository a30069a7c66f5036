//! Relation descriptors.
//!
//! A relation is a lookup descriptor keyed by `(table, field name)` — never
//! an owning pointer — so cyclic and self-referential associations resolve
//! lazily when first used.

use std::collections::BTreeMap;

/// The four association kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Both sides hold at most one row of the other.
    OneToOne,
    /// This side is the parent of many child rows.
    OneToMany,
    /// This side holds the foreign key to a single parent row.
    ManyToOne,
    /// Both sides hold many rows of the other, through a link table.
    ManyToMany,
}

impl RelationKind {
    /// Whether the related side is a row set rather than a single row.
    #[must_use]
    pub fn is_to_many(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    /// Whether this side's table holds the foreign key columns.
    #[must_use]
    pub fn owns_foreign_key(self) -> bool {
        matches!(self, Self::OneToOne | Self::ManyToOne)
    }
}

/// A declared association between two models.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    /// The association kind.
    pub kind: RelationKind,
    /// The related table.
    pub target: String,
    /// The field on the related table pointing back at this one.
    pub inverse: String,
    /// Key columns on this table. Defaults are filled at registration:
    /// the foreign-key columns for owning kinds, the primary key otherwise.
    pub local: Vec<String>,
    /// Key columns on the related table (or on the link table side of the
    /// related table for many-to-many).
    pub remote: Vec<String>,
    /// Columns aliased across both endpoints, local name to remote name.
    pub shared: BTreeMap<String, String>,
    /// Explicit link table for many-to-many; derived when absent.
    pub link: Option<String>,
}

impl Relation {
    /// Declares a relation of the given kind towards `target`, pointed back
    /// at by `inverse`.
    #[must_use]
    pub fn new(kind: RelationKind, target: &str, inverse: &str) -> Self {
        Self {
            kind,
            target: target.to_string(),
            inverse: inverse.to_string(),
            local: Vec::new(),
            remote: Vec::new(),
            shared: BTreeMap::new(),
            link: None,
        }
    }

    /// Sets the key columns on this table.
    #[must_use]
    pub fn local_fields(mut self, fields: &[&str]) -> Self {
        self.local = fields.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the key columns on the related table.
    #[must_use]
    pub fn remote_fields(mut self, fields: &[&str]) -> Self {
        self.remote = fields.iter().map(ToString::to_string).collect();
        self
    }

    /// Aliases a column across both endpoints of the relation.
    #[must_use]
    pub fn shared_field(mut self, local: &str, remote: &str) -> Self {
        self.shared.insert(local.to_string(), remote.to_string());
        self
    }

    /// Names an explicit link table for a many-to-many relation.
    #[must_use]
    pub fn through(mut self, table: &str) -> Self {
        self.link = Some(table.to_string());
        self
    }

    /// The link table name for a many-to-many relation: the explicit name
    /// when given, otherwise derived deterministically from both endpoints.
    #[must_use]
    pub fn link_table(&self, owner: &str) -> String {
        self.link
            .clone()
            .unwrap_or_else(|| derive_link_name(owner, &self.target))
    }
}

/// Derives the implicit association table name from the two endpoints.
///
/// The endpoints are lowercased and sorted so both sides of the relation
/// derive the same name.
#[must_use]
pub fn derive_link_name(left: &str, right: &str) -> String {
    let mut names = [left.to_lowercase(), right.to_lowercase()];
    names.sort();
    format!("{}_{}", names[0], names[1])
}

/// The column a link table uses for one side's primary key field.
#[must_use]
pub fn link_column(table: &str, field: &str) -> String {
    format!("{table}_{field}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_name_is_order_independent() {
        assert_eq!(derive_link_name("post", "tag"), "post_tag");
        assert_eq!(derive_link_name("tag", "post"), "post_tag");
    }

    #[test]
    fn test_explicit_link_table_wins() {
        let relation = Relation::new(RelationKind::ManyToMany, "tag", "posts").through("tagging");
        assert_eq!(relation.link_table("post"), "tagging");
    }

    #[test]
    fn test_link_columns() {
        assert_eq!(link_column("post", "id2"), "post_id2");
    }

    #[test]
    fn test_kind_predicates() {
        assert!(RelationKind::ManyToMany.is_to_many());
        assert!(!RelationKind::ManyToOne.is_to_many());
        assert!(RelationKind::OneToOne.owns_foreign_key());
        assert!(!RelationKind::OneToMany.owns_foreign_key());
    }
}
