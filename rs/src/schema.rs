//! Static schema descriptors and the Record trait

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::filter::Direction;

/// Format enforced on primary key values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// Canonical 8-4-4-4-12 hex UUID
    Uuid,
    /// Any non-empty string
    Opaque,
}

/// A column of an entity table
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub nullable: bool,
    /// Message reported when a create omits this field
    pub required: Option<&'static str>,
    /// Value filled in when a create omits this field
    pub default: Option<fn() -> Value>,
}

impl Field {
    /// A nullable, optional column
    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            nullable: true,
            required: None,
            default: None,
        }
    }

    /// A non-null column that must be present on create
    pub const fn required(name: &'static str, message: &'static str) -> Self {
        Self {
            name,
            nullable: false,
            required: Some(message),
            default: None,
        }
    }

    /// A non-null column that gets `default()` when omitted
    pub const fn defaulted(name: &'static str, default: fn() -> Value) -> Self {
        Self {
            name,
            nullable: false,
            required: None,
            default: Some(default),
        }
    }

    /// A non-null column computed by the layer above when omitted
    pub const fn computed(name: &'static str) -> Self {
        Self {
            name,
            nullable: false,
            required: None,
            default: None,
        }
    }
}

/// Fractional ordering column kept unique among rows sharing `scope`
#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    pub field: &'static str,
    /// Columns that group rows into sibling sets
    pub scope: &'static [&'static str],
}

/// Relation cardinality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// `foreign_key` lives on this table and points at the target's primary key
    BelongsTo,
    /// `foreign_key` lives on the target table and points at this primary key
    HasMany,
}

/// A named relation usable with eager loading
#[derive(Debug, Clone, Copy)]
pub struct Relation {
    pub name: &'static str,
    pub kind: RelationKind,
    pub foreign_key: &'static str,
    pub target: fn() -> &'static Schema,
}

/// Static metadata describing one entity table
#[derive(Debug)]
pub struct Schema {
    pub table: &'static str,
    pub primary_key: &'static str,
    pub id_format: IdFormat,
    pub fields: &'static [Field],
    pub relations: &'static [Relation],
    /// Soft-delete column, if the entity follows the discard pattern
    pub discard_field: Option<&'static str>,
    /// Whether rows carry a `lock_version` for optimistic concurrency
    pub versioned: bool,
    pub default_order: (&'static str, Direction),
    pub sort_key: Option<SortKey>,
}

impl Schema {
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_discardable(&self) -> bool {
        self.discard_field.is_some()
    }

    pub fn relation_names(&self) -> Vec<&'static str> {
        self.relations.iter().map(|r| r.name).collect()
    }
}

/// Trait implemented by every typed entity stored in a backend
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn schema() -> &'static Schema;

    fn id(&self) -> &str;

    fn updated_at(&self) -> i64;

    fn discarded_at(&self) -> Option<i64> {
        None
    }

    fn is_discarded(&self) -> bool {
        self.discarded_at().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PARENT: Schema = Schema {
        table: "parents",
        primary_key: "id",
        id_format: IdFormat::Uuid,
        fields: &[Field::required("name", "Name is required"), Field::optional("notes")],
        relations: &[Relation {
            name: "children",
            kind: RelationKind::HasMany,
            foreign_key: "parent_id",
            target: child_schema,
        }],
        discard_field: Some("discarded_at"),
        versioned: false,
        default_order: ("created_at", Direction::Asc),
        sort_key: None,
    };

    static CHILD: Schema = Schema {
        table: "children",
        primary_key: "id",
        id_format: IdFormat::Opaque,
        fields: &[],
        relations: &[],
        discard_field: None,
        versioned: true,
        default_order: ("created_at", Direction::Asc),
        sort_key: None,
    };

    fn child_schema() -> &'static Schema {
        &CHILD
    }

    #[test]
    fn test_relation_lookup() {
        let rel = PARENT.relation("children").unwrap();
        assert_eq!(rel.kind, RelationKind::HasMany);
        assert_eq!((rel.target)().table, "children");
        assert!(PARENT.relation("nope").is_none());
        assert_eq!(PARENT.relation_names(), vec!["children"]);
    }

    #[test]
    fn test_field_lookup() {
        let name = PARENT.field("name").unwrap();
        assert!(!name.nullable);
        assert_eq!(name.required, Some("Name is required"));
        assert!(PARENT.field("notes").unwrap().nullable);
    }

    #[test]
    fn test_discardable() {
        assert!(PARENT.is_discardable());
        assert!(!CHILD.is_discardable());
    }
}
