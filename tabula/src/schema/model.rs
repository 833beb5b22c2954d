use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

#[derive(Clone, Default)]
pub struct StableHasherBuilder;

impl BuildHasher for StableHasherBuilder {
    type Hasher = StableHasher;
    fn build_hasher(&self) -> Self::Hasher {
        StableHasher::new()
    }
}

/// Seeded xxhash so hashes are identical across processes and runs.
/// Used for advisory-lock keys; never for in-memory hash maps exposed to
/// attacker-controlled input.
pub struct StableHasher(XxHash64);

impl StableHasher {
    const DEFAULT_SEED: u64 = 27;

    pub fn new() -> Self {
        Self(XxHash64::with_seed(Self::DEFAULT_SEED))
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for StableHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes);
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0.finish()
    }
}

/// Stable 64-bit key for a name, suitable as a session advisory-lock key.
pub fn stable_key(name: &str) -> i64 {
    let mut hasher = StableHasher::new();
    name.hash(&mut hasher);
    hasher.finish() as i64
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum ElementKind {
    Table,
    Column,
    Index,
    Constraint,
}

/// Canonical key of a schema element. Unique within any schema snapshot,
/// logical or live. For `ElementKind::Table` the element name repeats the
/// table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub table: String,
    pub kind: ElementKind,
    pub name: String,
}

impl ElementId {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            kind: ElementKind::Table,
            name: table.to_string(),
        }
    }

    pub fn column(table: &str, name: &str) -> Self {
        Self {
            table: table.to_string(),
            kind: ElementKind::Column,
            name: name.to_string(),
        }
    }

    pub fn index(table: &str, name: &str) -> Self {
        Self {
            table: table.to_string(),
            kind: ElementKind::Index,
            name: name.to_string(),
        }
    }

    pub fn constraint(table: &str, name: &str) -> Self {
        Self {
            table: table.to_string(),
            kind: ElementKind::Constraint,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == ElementKind::Table {
            write!(f, "table {}", self.table)
        } else {
            write!(f, "{} {}.{}", self.kind, self.table, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    SmallInt,
    Int,
    BigInt,
    Decimal { precision: u8, scale: u8 },
    Float,
    Double,
    Varchar { length: u32 },
    Text,
    Blob,
    Date,
    Timestamp,
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::SmallInt => write!(f, "smallint"),
            ColumnType::Int => write!(f, "int"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
            ColumnType::Float => write!(f, "float"),
            ColumnType::Double => write!(f, "double"),
            ColumnType::Varchar { length } => write!(f, "varchar({length})"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Blob => write!(f, "blob"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::Json => write!(f, "json"),
        }
    }
}

/// Column defaults are stored normalized: every store-specific spelling of
/// "now" collapses to `CurrentTimestamp` before it reaches the diff engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DefaultValue {
    Literal(String),
    CurrentTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub unsigned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub on_update_auto: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnDecl {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: false,
            unsigned: false,
            default: None,
            auto_increment: false,
            on_update_auto: false,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    BTree,
    FullText,
}

impl Default for IndexKind {
    fn default() -> Self {
        IndexKind::BTree
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDecl {
    pub name: String,
    #[serde(default)]
    pub kind: IndexKind,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl Default for ReferenceAction {
    fn default() -> Self {
        ReferenceAction::NoAction
    }
}

impl fmt::Display for ReferenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceAction::Cascade => write!(f, "CASCADE"),
            ReferenceAction::SetNull => write!(f, "SET NULL"),
            ReferenceAction::Restrict => write!(f, "RESTRICT"),
            ReferenceAction::NoAction => write!(f, "NO ACTION"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintDecl {
    Primary {
        columns: Vec<String>,
    },
    Unique {
        columns: Vec<String>,
    },
    Foreign {
        column: String,
        referenced_table: String,
        referenced_column: String,
        #[serde(default)]
        on_delete: ReferenceAction,
    },
    Check {
        expression: String,
    },
}

impl ConstraintDecl {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ConstraintDecl::Primary { .. } => "primary",
            ConstraintDecl::Unique { .. } => "unique",
            ConstraintDecl::Foreign { .. } => "foreign",
            ConstraintDecl::Check { .. } => "check",
        }
    }

    /// Referenced (table, column) if this is a foreign key.
    pub fn reference(&self) -> Option<(&str, &str)> {
        match self {
            ConstraintDecl::Foreign {
                referenced_table,
                referenced_column,
                ..
            } => Some((referenced_table, referenced_column)),
            _ => None,
        }
    }
}

/// A table as declared or introspected. Column, index and constraint order is
/// preserved because it is meaningful for rendering `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub columns: IndexMap<String, ColumnDecl>,
    #[serde(default)]
    pub indexes: IndexMap<String, IndexDecl>,
    #[serde(default)]
    pub constraints: IndexMap<String, ConstraintDecl>,
}

impl TableDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            engine: None,
            comment: None,
            columns: IndexMap::new(),
            indexes: IndexMap::new(),
            constraints: IndexMap::new(),
        }
    }

    /// Ids of every element this table carries, the table itself included.
    pub fn element_ids(&self) -> Vec<ElementId> {
        let mut ids = vec![ElementId::table(&self.name)];
        ids.extend(self.columns.keys().map(|c| ElementId::column(&self.name, c)));
        ids.extend(self.indexes.keys().map(|i| ElementId::index(&self.name, i)));
        ids.extend(
            self.constraints
                .keys()
                .map(|c| ElementId::constraint(&self.name, c)),
        );
        ids
    }

    /// Foreign constraints declared on this table as (constraint name, decl).
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&String, &ConstraintDecl)> {
        self.constraints
            .iter()
            .filter(|(_, c)| matches!(c, ConstraintDecl::Foreign { .. }))
    }
}

/// One module's partial view of the shared schema. A module may declare
/// columns on a table primarily owned by another module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleContribution {
    pub module_id: String,
    pub schema_version: String,
    #[serde(default)]
    pub tables: Vec<TableDecl>,
}

/// The merged declarative target: every table from every contribution, plus
/// the record of which modules currently declare each element.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogicalSchema {
    pub tables: BTreeMap<String, TableDecl>,
    pub ownership: BTreeMap<ElementId, BTreeSet<String>>,
}

impl LogicalSchema {
    pub fn owners(&self, id: &ElementId) -> Option<&BTreeSet<String>> {
        self.ownership.get(id)
    }

    pub fn is_owned_by(&self, id: &ElementId, module: &str) -> bool {
        self.ownership
            .get(id)
            .is_some_and(|owners| owners.contains(module))
    }

    /// Content fingerprint of the declared structure. Ownership is excluded:
    /// two schemas that would render the same DDL share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let canonical =
            serde_json::to_vec(&self.tables).expect("schema serialization cannot fail");
        blake3::hash(&canonical).to_hex().to_string()
    }
}

/// What the database actually contains right now. Same shape as
/// [`LogicalSchema`] minus ownership, which is a declarative concept the
/// store knows nothing about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LiveSchema {
    pub tables: BTreeMap<String, TableDecl>,
}

impl LiveSchema {
    pub fn column(&self, table: &str, name: &str) -> Option<&ColumnDecl> {
        self.tables.get(table).and_then(|t| t.columns.get(name))
    }

    pub fn index(&self, table: &str, name: &str) -> Option<&IndexDecl> {
        self.tables.get(table).and_then(|t| t.indexes.get(name))
    }

    pub fn constraint(&self, table: &str, name: &str) -> Option<&ConstraintDecl> {
        self.tables.get(table).and_then(|t| t.constraints.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varchar(n: u32) -> ColumnType {
        ColumnType::Varchar { length: n }
    }

    #[test]
    fn test_stable_key_deterministic() {
        assert_eq!(stable_key("appdb"), stable_key("appdb"));
        assert_ne!(stable_key("appdb"), stable_key("otherdb"));
    }

    #[test]
    fn test_element_id_display() {
        assert_eq!(ElementId::table("orders").to_string(), "table orders");
        assert_eq!(
            ElementId::column("orders", "status").to_string(),
            "column orders.status"
        );
    }

    #[test]
    fn test_element_id_ordering_is_total() {
        let mut set = BTreeSet::new();
        set.insert(ElementId::column("orders", "status"));
        set.insert(ElementId::table("orders"));
        set.insert(ElementId::index("orders", "idx_status"));
        assert_eq!(set.len(), 3);
    }

    // Equality must be total: precision/scale and default sentinels count.
    #[test]
    fn test_column_equality_is_exact() {
        let mut a = ColumnDecl::new("price", ColumnType::Decimal { precision: 12, scale: 4 });
        let b = a.clone();
        assert_eq!(a, b);

        a.ty = ColumnType::Decimal { precision: 12, scale: 2 };
        assert_ne!(a, b);

        let mut c = ColumnDecl::new("created_at", ColumnType::Timestamp);
        let mut d = c.clone();
        c.default = Some(DefaultValue::CurrentTimestamp);
        d.default = Some(DefaultValue::Literal("now()".into()));
        assert_ne!(c, d);
    }

    #[test]
    fn test_table_element_ids() {
        let mut t = TableDecl::new("orders");
        t.columns
            .insert("id".into(), ColumnDecl::new("id", ColumnType::Int));
        t.indexes.insert(
            "idx_id".into(),
            IndexDecl {
                name: "idx_id".into(),
                kind: IndexKind::BTree,
                columns: vec!["id".into()],
            },
        );
        t.constraints.insert(
            "pk".into(),
            ConstraintDecl::Primary {
                columns: vec!["id".into()],
            },
        );
        let ids = t.element_ids();
        assert_eq!(ids.len(), 4);
        assert!(ids.contains(&ElementId::table("orders")));
        assert!(ids.contains(&ElementId::constraint("orders", "pk")));
    }

    #[test]
    fn test_fingerprint_ignores_ownership() {
        let mut t = TableDecl::new("orders");
        t.columns
            .insert("id".into(), ColumnDecl::new("id", ColumnType::Int));

        let mut a = LogicalSchema::default();
        a.tables.insert("orders".into(), t.clone());

        let mut b = LogicalSchema::default();
        b.tables.insert("orders".into(), t);
        b.ownership
            .entry(ElementId::table("orders"))
            .or_default()
            .insert("Acme_Sales".into());

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_structure() {
        let mut t = TableDecl::new("orders");
        t.columns
            .insert("id".into(), ColumnDecl::new("id", ColumnType::Int));
        let mut a = LogicalSchema::default();
        a.tables.insert("orders".into(), t.clone());

        let mut b = a.clone();
        b.tables
            .get_mut("orders")
            .unwrap()
            .columns
            .insert("note".into(), ColumnDecl::new("note", varchar(64)));

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_contribution_round_trips_through_json() {
        let json = r#"{
            "module_id": "Acme_Sales",
            "schema_version": "1.2.0",
            "tables": [{
                "name": "orders",
                "columns": {
                    "id": {"name": "id", "type": {"kind": "int"}, "auto_increment": true},
                    "status": {"name": "status", "type": {"kind": "varchar", "length": 32}, "nullable": true}
                },
                "constraints": {
                    "pk_orders": {"type": "primary", "columns": ["id"]}
                }
            }]
        }"#;
        let parsed: ModuleContribution = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.module_id, "Acme_Sales");
        let table = &parsed.tables[0];
        assert_eq!(table.columns["status"].ty, varchar(32));
        assert!(table.columns["id"].auto_increment);

        let back = serde_json::to_string(&parsed).unwrap();
        let reparsed: ModuleContribution = serde_json::from_str(&back).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
