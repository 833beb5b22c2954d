#![allow(async_fn_in_trait)]

use std::collections::BTreeMap;

use sqlx::PgConnection;
use thiserror::Error;

use crate::schema::model::{
    ColumnDecl, ColumnType, ConstraintDecl, DefaultValue, IndexDecl, IndexKind, LiveSchema,
    ReferenceAction, TableDecl,
};

#[derive(Debug, Error)]
pub enum IntrospectError {
    #[error("database error during introspection")]
    Db(#[from] sqlx::Error),

    #[error("unsupported column type {data_type} on {table}.{column}")]
    UnsupportedType {
        table: String,
        column: String,
        data_type: String,
    },
}

/// The single component that reads the live connection. Everything it
/// returns is normalized into the shared object model: the diff engine never
/// sees a store-specific spelling.
pub trait Introspector {
    async fn snapshot(&mut self) -> Result<LiveSchema, IntrospectError>;
}

pub struct PgIntrospector {
    conn: PgConnection,
}

impl PgIntrospector {
    pub fn new(conn: PgConnection) -> Self {
        Self { conn }
    }
}

impl Introspector for PgIntrospector {
    async fn snapshot(&mut self) -> Result<LiveSchema, IntrospectError> {
        snapshot_postgres(&mut self.conn).await
    }
}

/// Build a [`LiveSchema`] from the `public` schema of a Postgres catalog.
pub async fn snapshot_postgres(conn: &mut PgConnection) -> Result<LiveSchema, IntrospectError> {
    let mut live = LiveSchema::default();

    let tables: Vec<(String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT c.relname::text, obj_description(c.oid)
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = 'public' AND c.relkind = 'r'
        ORDER BY c.relname
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (name, comment) in tables {
        if name == crate::db::STATE_TABLE {
            continue;
        }
        let mut table = TableDecl::new(&name);
        table.comment = comment.filter(|c| !c.is_empty());
        live.tables.insert(name, table);
    }

    load_columns(conn, &mut live).await?;
    load_key_constraints(conn, &mut live).await?;
    load_foreign_keys(conn, &mut live).await?;
    load_check_constraints(conn, &mut live).await?;
    load_indexes(conn, &mut live).await?;
    load_touch_triggers(conn, &mut live).await?;

    Ok(live)
}

async fn load_columns(
    conn: &mut PgConnection,
    live: &mut LiveSchema,
) -> Result<(), IntrospectError> {
    type Row = (
        String,
        String,
        String,
        String,
        Option<String>,
        Option<i32>,
        Option<i32>,
        Option<i32>,
        String,
        Option<String>,
    );
    let rows: Vec<Row> = sqlx::query_as(
        r#"
        SELECT c.table_name::text, c.column_name::text, c.data_type::text,
               c.is_nullable::text, c.column_default::text,
               c.character_maximum_length::int, c.numeric_precision::int,
               c.numeric_scale::int, c.is_identity::text,
               col_description(format('%I.%I', c.table_schema, c.table_name)::regclass::oid,
                               c.ordinal_position::int)
        FROM information_schema.columns c
        WHERE c.table_schema = 'public'
        ORDER BY c.table_name, c.ordinal_position
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (table, name, data_type, is_nullable, default, char_len, precision, scale, is_identity, comment) in
        rows
    {
        let Some(decl) = live.tables.get_mut(&table) else {
            continue;
        };
        let ty = map_data_type(&data_type, char_len, precision, scale).ok_or_else(|| {
            IntrospectError::UnsupportedType {
                table: table.clone(),
                column: name.clone(),
                data_type: data_type.clone(),
            }
        })?;

        let auto_increment = is_identity == "YES"
            || default
                .as_deref()
                .is_some_and(|d| d.trim_start().starts_with("nextval("));

        let mut column = ColumnDecl::new(&name, ty);
        column.nullable = is_nullable == "YES";
        column.default = if auto_increment {
            None
        } else {
            default.as_deref().and_then(normalize_default)
        };
        column.auto_increment = auto_increment;
        column.comment = comment.filter(|c| !c.is_empty());
        decl.columns.insert(name, column);
    }
    Ok(())
}

async fn load_key_constraints(
    conn: &mut PgConnection,
    live: &mut LiveSchema,
) -> Result<(), IntrospectError> {
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(
        r#"
        SELECT tc.table_name::text, tc.constraint_name::text,
               tc.constraint_type::text, kcu.column_name::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON kcu.constraint_name = tc.constraint_name
         AND kcu.table_schema = tc.table_schema
        WHERE tc.table_schema = 'public'
          AND tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE')
        ORDER BY tc.table_name, tc.constraint_name, kcu.ordinal_position
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut grouped: BTreeMap<(String, String, String), Vec<String>> = BTreeMap::new();
    for (table, name, kind, column) in rows {
        grouped.entry((table, name, kind)).or_default().push(column);
    }

    for ((table, name, kind), columns) in grouped {
        let Some(decl) = live.tables.get_mut(&table) else {
            continue;
        };
        let constraint = if kind == "PRIMARY KEY" {
            ConstraintDecl::Primary { columns }
        } else {
            ConstraintDecl::Unique { columns }
        };
        decl.constraints.insert(name, constraint);
    }
    Ok(())
}

async fn load_foreign_keys(
    conn: &mut PgConnection,
    live: &mut LiveSchema,
) -> Result<(), IntrospectError> {
    let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
        r#"
        SELECT tc.table_name::text, tc.constraint_name::text, kcu.column_name::text,
               ccu.table_name::text, ccu.column_name::text, rc.delete_rule::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON kcu.constraint_name = tc.constraint_name
         AND kcu.table_schema = tc.table_schema
        JOIN information_schema.referential_constraints rc
          ON rc.constraint_name = tc.constraint_name
         AND rc.constraint_schema = tc.table_schema
        JOIN information_schema.constraint_column_usage ccu
          ON ccu.constraint_name = tc.constraint_name
         AND ccu.table_schema = tc.table_schema
        WHERE tc.table_schema = 'public' AND tc.constraint_type = 'FOREIGN KEY'
        ORDER BY tc.table_name, tc.constraint_name
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (table, name, column, referenced_table, referenced_column, delete_rule) in rows {
        let Some(decl) = live.tables.get_mut(&table) else {
            continue;
        };
        decl.constraints.insert(
            name,
            ConstraintDecl::Foreign {
                column,
                referenced_table,
                referenced_column,
                on_delete: map_reference_action(&delete_rule),
            },
        );
    }
    Ok(())
}

async fn load_check_constraints(
    conn: &mut PgConnection,
    live: &mut LiveSchema,
) -> Result<(), IntrospectError> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT rel.relname::text, con.conname::text, pg_get_constraintdef(con.oid)
        FROM pg_constraint con
        JOIN pg_class rel ON rel.oid = con.conrelid
        JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
        WHERE nsp.nspname = 'public' AND con.contype = 'c'
        ORDER BY rel.relname, con.conname
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (table, name, definition) in rows {
        let Some(decl) = live.tables.get_mut(&table) else {
            continue;
        };
        // Checks rendered for unsigned columns fold back into the column
        // instead of surfacing as constraints.
        if let Some(column) = unsigned_check_column(&table, &name) {
            if let Some(col) = decl.columns.get_mut(column) {
                col.unsigned = true;
                continue;
            }
        }
        decl.constraints.insert(
            name,
            ConstraintDecl::Check {
                expression: normalize_check_expression(&definition),
            },
        );
    }
    Ok(())
}

async fn load_indexes(
    conn: &mut PgConnection,
    live: &mut LiveSchema,
) -> Result<(), IntrospectError> {
    let rows: Vec<(String, String, String, String, Vec<String>)> = sqlx::query_as(
        r#"
        SELECT t.relname::text, i.relname::text, am.amname::text,
               pg_get_indexdef(ix.indexrelid),
               COALESCE(array_agg(a.attname::text ORDER BY k.ord)
                        FILTER (WHERE a.attname IS NOT NULL), '{}')
        FROM pg_index ix
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_am am ON am.oid = i.relam
        LEFT JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord) ON true
        LEFT JOIN pg_attribute a
          ON a.attrelid = t.oid AND a.attnum = k.attnum AND k.attnum <> 0
        WHERE n.nspname = 'public'
          AND NOT ix.indisprimary
          AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = ix.indexrelid)
        GROUP BY t.relname, i.relname, am.amname, ix.indexrelid
        ORDER BY t.relname, i.relname
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (table, name, method, definition, columns) in rows {
        let Some(decl) = live.tables.get_mut(&table) else {
            continue;
        };
        let index = match method.as_str() {
            "btree" => IndexDecl {
                name: name.clone(),
                kind: IndexKind::BTree,
                columns,
            },
            "gin" if definition.contains("to_tsvector") => IndexDecl {
                name: name.clone(),
                kind: IndexKind::FullText,
                columns: fulltext_columns(&definition),
            },
            other => {
                tracing::warn!(table = %table, index = %name, method = %other, "index uses an access method outside the object model, leaving untouched");
                continue;
            }
        };
        decl.indexes.insert(name, index);
    }
    Ok(())
}

async fn load_touch_triggers(
    conn: &mut PgConnection,
    live: &mut LiveSchema,
) -> Result<(), IntrospectError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT event_object_table::text, trigger_name::text
        FROM information_schema.triggers
        WHERE trigger_schema = 'public'
        GROUP BY event_object_table, trigger_name
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (table, trigger) in rows {
        let Some(column) = touch_trigger_column(&table, &trigger) else {
            continue;
        };
        if let Some(col) = live
            .tables
            .get_mut(&table)
            .and_then(|t| t.columns.get_mut(column))
        {
            col.on_update_auto = true;
        }
    }
    Ok(())
}

fn map_data_type(
    data_type: &str,
    char_len: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> Option<ColumnType> {
    let ty = match data_type {
        "boolean" => ColumnType::Boolean,
        "smallint" => ColumnType::SmallInt,
        "integer" => ColumnType::Int,
        "bigint" => ColumnType::BigInt,
        "numeric" => ColumnType::Decimal {
            precision: precision.unwrap_or(10) as u8,
            scale: scale.unwrap_or(0) as u8,
        },
        "real" => ColumnType::Float,
        "double precision" => ColumnType::Double,
        "character varying" | "character" => match char_len {
            Some(length) => ColumnType::Varchar {
                length: length as u32,
            },
            None => ColumnType::Text,
        },
        "text" => ColumnType::Text,
        "bytea" => ColumnType::Blob,
        "date" => ColumnType::Date,
        "timestamp with time zone" | "timestamp without time zone" => ColumnType::Timestamp,
        "json" | "jsonb" => ColumnType::Json,
        _ => return None,
    };
    Some(ty)
}

fn map_reference_action(rule: &str) -> ReferenceAction {
    match rule {
        "CASCADE" => ReferenceAction::Cascade,
        "SET NULL" => ReferenceAction::SetNull,
        "RESTRICT" => ReferenceAction::Restrict,
        _ => ReferenceAction::NoAction,
    }
}

/// Collapse Postgres default spellings into the normalized model:
/// cast suffixes are stripped, every spelling of "now" becomes the
/// `CurrentTimestamp` sentinel, quoted literals are unquoted.
fn normalize_default(raw: &str) -> Option<DefaultValue> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_cast = trimmed.split("::").next().unwrap_or(trimmed).trim();
    let lowered = without_cast.to_ascii_lowercase();
    match lowered.as_str() {
        "null" => return None,
        "now()" | "current_timestamp" | "current_timestamp()" | "transaction_timestamp()" => {
            return Some(DefaultValue::CurrentTimestamp);
        }
        _ => {}
    }
    if lowered.starts_with("nextval(") {
        return None;
    }
    let unquoted = without_cast
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .map(|s| s.replace("''", "'"));
    Some(DefaultValue::Literal(
        unquoted.unwrap_or_else(|| without_cast.to_string()),
    ))
}

/// `pg_get_constraintdef` wraps expressions as `CHECK ((expr))`; peel down
/// to the bare expression so declared and introspected checks compare equal.
fn normalize_check_expression(definition: &str) -> String {
    let mut expr = definition.trim();
    expr = expr.strip_prefix("CHECK").unwrap_or(expr).trim();
    loop {
        let stripped = expr
            .strip_prefix('(')
            .and_then(|e| e.strip_suffix(')'))
            .map(str::trim);
        match stripped {
            Some(inner) if balanced(inner) => expr = inner,
            _ => break,
        }
    }
    expr.to_string()
}

fn balanced(expr: &str) -> bool {
    let mut depth = 0i32;
    for ch in expr.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Name of the column an unsigned-guard check was generated for, if the
/// constraint follows the `<table>_<column>_unsigned` convention.
fn unsigned_check_column<'n>(table: &str, constraint: &'n str) -> Option<&'n str> {
    constraint
        .strip_prefix(table)?
        .strip_prefix('_')?
        .strip_suffix("_unsigned")
}

/// Columns mentioned by a generated full-text index definition.
fn fulltext_columns(definition: &str) -> Vec<String> {
    let lowered = definition.to_ascii_lowercase();
    let mut columns = Vec::new();
    let mut offset = 0;
    while let Some(position) = lowered[offset..].find("coalesce(") {
        let start = offset + position + "coalesce(".len();
        let name: String = definition[start..]
            .chars()
            .skip_while(|c| *c == '"')
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            columns.push(name);
        }
        offset = start;
    }
    columns
}

/// Column targeted by an on-update touch trigger, per the
/// `tabula_onupd__<table>__<column>` naming convention.
fn touch_trigger_column<'n>(table: &'n str, trigger: &'n str) -> Option<&'n str> {
    trigger
        .strip_prefix("tabula_onupd__")?
        .strip_prefix(table)?
        .strip_prefix("__")
}
