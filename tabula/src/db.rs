use sqlx::{Connection, PgConnection};
use thiserror::Error;

use crate::conf::Conf;
use crate::schema::diff::Operation;
use crate::schema::exec::{SchemaStore, StoreError};
use crate::schema::introspect::snapshot_postgres;
use crate::schema::model::{
    ColumnDecl, ColumnType, ConstraintDecl, DefaultValue, IndexDecl, IndexKind, LiveSchema,
    TableDecl, stable_key,
};

/// Marker table recording the fingerprint of the last fully applied logical
/// schema. Excluded from introspection.
pub const STATE_TABLE: &str = "_tabula_state";

#[derive(Debug)]
pub enum IntegrityKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
    Exclusion,
    Other(String),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("integrity violation")]
    Integrity {
        kind: IntegrityKind,
        constraint: Option<String>,
        #[source]
        source: sqlx::Error,
    },
    #[error("temporary database failure")]
    Temporary,
    #[error("unhandled db error")]
    Fatal(sqlx::Error),
}

impl DbError {
    pub const fn code(&self) -> &'static str {
        match self {
            DbError::Integrity { .. } => "integrity_violation",
            DbError::Temporary => "temporary_error",
            DbError::Fatal(_) => "fatal_error",
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let kind = match db.code().as_deref() {
                    Some("23505") => IntegrityKind::Unique,
                    Some("23503") => IntegrityKind::ForeignKey,
                    Some("23514") => IntegrityKind::Check,
                    Some("23502") => IntegrityKind::NotNull,
                    Some("23P01") => IntegrityKind::Exclusion,
                    c => IntegrityKind::Other(c.unwrap_or_default().into()),
                };
                DbError::Integrity {
                    kind,
                    constraint: db.constraint().map(|s| s.to_owned()),
                    source: e,
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => DbError::Temporary,
            _ => DbError::Fatal(e),
        }
    }
}

/// Schema store backed by a single Postgres connection. One connection for
/// the whole run: the advisory lock is session-scoped and the per-table
/// units are plain BEGIN/COMMIT on the same session.
pub struct PgStore {
    conn: PgConnection,
    lock_key: i64,
    lock_scope: String,
}

impl PgStore {
    pub async fn connect(conf: &Conf) -> Result<Self, sqlx::Error> {
        let conn = PgConnection::connect(&conf.database_url).await?;
        let scope = conf.lock_scope.clone();
        Ok(Self {
            conn,
            lock_key: stable_key(&scope),
            lock_scope: scope,
        })
    }

    async fn run(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        tracing::trace!(%sql, "executing");
        sqlx::query(sql).execute(&mut self.conn).await?;
        Ok(())
    }

    async fn ensure_state_table(&mut self) -> Result<(), sqlx::Error> {
        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                id smallint PRIMARY KEY DEFAULT 1 CHECK (id = 1),
                fingerprint text NOT NULL,
                applied_at timestamptz NOT NULL DEFAULT now()
            )"#,
            quote_ident(STATE_TABLE)
        );
        self.run(&sql).await
    }
}

impl SchemaStore for PgStore {
    async fn snapshot(&mut self) -> Result<LiveSchema, StoreError> {
        Ok(snapshot_postgres(&mut self.conn).await?)
    }

    async fn execute(&mut self, op: &Operation) -> Result<(), StoreError> {
        for sql in render_ddl(op) {
            if let Err(e) = self.run(&sql).await {
                let classified = DbError::from(e);
                return Err(StoreError::Ddl {
                    element: op.element_id(),
                    message: format!("{} ({})", classified, classified.code()),
                });
            }
        }
        Ok(())
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn begin_unit(&mut self) -> Result<(), StoreError> {
        self.run("BEGIN").await.map_err(StoreError::Db)
    }

    async fn commit_unit(&mut self) -> Result<(), StoreError> {
        self.run("COMMIT").await.map_err(StoreError::Db)
    }

    async fn rollback_unit(&mut self) -> Result<(), StoreError> {
        self.run("ROLLBACK").await.map_err(StoreError::Db)
    }

    async fn acquire_lock(&mut self) -> Result<(), StoreError> {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut self.conn)
            .await?;
        if !locked {
            return Err(StoreError::LockUnavailable(self.lock_scope.clone()));
        }
        Ok(())
    }

    async fn release_lock(&mut self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn read_fingerprint(&mut self) -> Result<Option<String>, StoreError> {
        self.ensure_state_table().await?;
        let sql = format!(
            "SELECT fingerprint FROM {} WHERE id = 1",
            quote_ident(STATE_TABLE)
        );
        let fingerprint: Option<String> = sqlx::query_scalar(&sql)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(fingerprint)
    }

    async fn write_fingerprint(&mut self, fingerprint: &str) -> Result<(), StoreError> {
        self.ensure_state_table().await?;
        let sql = format!(
            r#"INSERT INTO {} (id, fingerprint) VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE
               SET fingerprint = excluded.fingerprint, applied_at = now()"#,
            quote_ident(STATE_TABLE)
        );
        sqlx::query(&sql)
            .bind(fingerprint)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_type(ty: &ColumnType) -> String {
    match ty {
        ColumnType::Boolean => "boolean".into(),
        ColumnType::SmallInt => "smallint".into(),
        ColumnType::Int => "integer".into(),
        ColumnType::BigInt => "bigint".into(),
        ColumnType::Decimal { precision, scale } => format!("numeric({precision},{scale})"),
        ColumnType::Float => "real".into(),
        ColumnType::Double => "double precision".into(),
        ColumnType::Varchar { length } => format!("varchar({length})"),
        ColumnType::Text => "text".into(),
        ColumnType::Blob => "bytea".into(),
        ColumnType::Date => "date".into(),
        ColumnType::Timestamp => "timestamptz".into(),
        ColumnType::Json => "jsonb".into(),
    }
}

fn is_numeric(ty: &ColumnType) -> bool {
    matches!(
        ty,
        ColumnType::Boolean
            | ColumnType::SmallInt
            | ColumnType::Int
            | ColumnType::BigInt
            | ColumnType::Decimal { .. }
            | ColumnType::Float
            | ColumnType::Double
    )
}

fn render_default(column: &ColumnDecl, default: &DefaultValue) -> String {
    match default {
        DefaultValue::CurrentTimestamp => "now()".into(),
        DefaultValue::Literal(value) if is_numeric(&column.ty) => value.clone(),
        DefaultValue::Literal(value) => quote_literal(value),
    }
}

fn column_sql(column: &ColumnDecl) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), sql_type(&column.ty));
    if column.auto_increment {
        sql.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(&format!(" DEFAULT {}", render_default(column, default)));
    }
    sql
}

fn constraint_sql(name: &str, constraint: &ConstraintDecl) -> String {
    let body = match constraint {
        ConstraintDecl::Primary { columns } => {
            format!("PRIMARY KEY ({})", quoted_list(columns))
        }
        ConstraintDecl::Unique { columns } => format!("UNIQUE ({})", quoted_list(columns)),
        ConstraintDecl::Foreign {
            column,
            referenced_table,
            referenced_column,
            on_delete,
        } => format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote_ident(column),
            quote_ident(referenced_table),
            quote_ident(referenced_column),
            on_delete
        ),
        ConstraintDecl::Check { expression } => format!("CHECK ({expression})"),
    };
    format!("CONSTRAINT {} {}", quote_ident(name), body)
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn unsigned_constraint_name(table: &str, column: &str) -> String {
    format!("{table}_{column}_unsigned")
}

fn unsigned_constraint_sql(table: &str, column: &str) -> String {
    format!(
        "CONSTRAINT {} CHECK ({} >= 0)",
        quote_ident(&unsigned_constraint_name(table, column)),
        quote_ident(column)
    )
}

fn touch_trigger_name(table: &str, column: &str) -> String {
    format!("tabula_onupd__{table}__{column}")
}

fn touch_trigger_sql(table: &str, column: &str) -> Vec<String> {
    let name = touch_trigger_name(table, column);
    vec![
        format!(
            "CREATE OR REPLACE FUNCTION {}() RETURNS trigger LANGUAGE plpgsql AS $$ BEGIN NEW.{} := now(); RETURN NEW; END $$",
            quote_ident(&name),
            quote_ident(column)
        ),
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_ident(&name),
            quote_ident(table)
        ),
        format!(
            "CREATE TRIGGER {} BEFORE UPDATE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            quote_ident(&name),
            quote_ident(table),
            quote_ident(&name)
        ),
    ]
}

fn drop_touch_trigger_sql(table: &str, column: &str) -> Vec<String> {
    let name = touch_trigger_name(table, column);
    vec![
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_ident(&name),
            quote_ident(table)
        ),
        format!("DROP FUNCTION IF EXISTS {}()", quote_ident(&name)),
    ]
}

fn index_sql(table: &str, index: &IndexDecl) -> String {
    match index.kind {
        IndexKind::BTree => format!(
            "CREATE INDEX {} ON {} ({})",
            quote_ident(&index.name),
            quote_ident(table),
            quoted_list(&index.columns)
        ),
        IndexKind::FullText => {
            let body = index
                .columns
                .iter()
                .map(|c| format!("COALESCE({}, '')", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(" || ' ' || ");
            format!(
                "CREATE INDEX {} ON {} USING gin (to_tsvector('simple', {}))",
                quote_ident(&index.name),
                quote_ident(table),
                body
            )
        }
    }
}

fn comment_sql(target: &str, comment: Option<&str>) -> String {
    match comment {
        Some(text) => format!("COMMENT ON {} IS {}", target, quote_literal(text)),
        None => format!("COMMENT ON {} IS NULL", target),
    }
}

fn create_table_sql(table: &TableDecl) -> Vec<String> {
    let mut lines: Vec<String> = table.columns.values().map(column_sql).collect();
    for column in table.columns.values() {
        if column.unsigned {
            lines.push(unsigned_constraint_sql(&table.name, &column.name));
        }
    }
    for (name, constraint) in &table.constraints {
        lines.push(constraint_sql(name, constraint));
    }

    // Engine hints have no Postgres rendering.
    let mut statements = vec![format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_ident(&table.name),
        lines.join(",\n  ")
    )];

    if let Some(comment) = &table.comment {
        statements.push(comment_sql(
            &format!("TABLE {}", quote_ident(&table.name)),
            Some(comment),
        ));
    }
    for column in table.columns.values() {
        if let Some(comment) = &column.comment {
            statements.push(comment_sql(
                &format!(
                    "COLUMN {}.{}",
                    quote_ident(&table.name),
                    quote_ident(&column.name)
                ),
                Some(comment),
            ));
        }
        if column.on_update_auto {
            statements.extend(touch_trigger_sql(&table.name, &column.name));
        }
    }
    for index in table.indexes.values() {
        statements.push(index_sql(&table.name, index));
    }
    statements
}

fn add_column_sql(table: &str, column: &ColumnDecl) -> Vec<String> {
    let mut statements = vec![format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(table),
        column_sql(column)
    )];
    if column.unsigned {
        statements.push(format!(
            "ALTER TABLE {} ADD {}",
            quote_ident(table),
            unsigned_constraint_sql(table, &column.name)
        ));
    }
    if let Some(comment) = &column.comment {
        statements.push(comment_sql(
            &format!("COLUMN {}.{}", quote_ident(table), quote_ident(&column.name)),
            Some(comment),
        ));
    }
    if column.on_update_auto {
        statements.extend(touch_trigger_sql(table, &column.name));
    }
    statements
}

/// Modify renders the full desired state of the column: type, nullability,
/// default, identity, the unsigned guard and the touch trigger are each put
/// where the declaration says they belong.
fn modify_column_sql(table: &str, column: &ColumnDecl) -> Vec<String> {
    let table_q = quote_ident(table);
    let column_q = quote_ident(&column.name);
    let ty = sql_type(&column.ty);
    let mut statements = vec![format!(
        "ALTER TABLE {table_q} ALTER COLUMN {column_q} TYPE {ty} USING {column_q}::{ty}"
    )];

    if column.nullable {
        statements.push(format!(
            "ALTER TABLE {table_q} ALTER COLUMN {column_q} DROP NOT NULL"
        ));
    } else {
        statements.push(format!(
            "ALTER TABLE {table_q} ALTER COLUMN {column_q} SET NOT NULL"
        ));
    }

    match &column.default {
        Some(default) => statements.push(format!(
            "ALTER TABLE {table_q} ALTER COLUMN {column_q} SET DEFAULT {}",
            render_default(column, default)
        )),
        None if !column.auto_increment => statements.push(format!(
            "ALTER TABLE {table_q} ALTER COLUMN {column_q} DROP DEFAULT"
        )),
        None => {}
    }

    // Drop-then-add keeps the identity change runnable whatever the live
    // column looked like before.
    statements.push(format!(
        "ALTER TABLE {table_q} ALTER COLUMN {column_q} DROP IDENTITY IF EXISTS"
    ));
    if column.auto_increment {
        statements.push(format!(
            "ALTER TABLE {table_q} ALTER COLUMN {column_q} ADD GENERATED BY DEFAULT AS IDENTITY"
        ));
    }

    statements.push(format!(
        "ALTER TABLE {table_q} DROP CONSTRAINT IF EXISTS {}",
        quote_ident(&unsigned_constraint_name(table, &column.name))
    ));
    if column.unsigned {
        statements.push(format!(
            "ALTER TABLE {table_q} ADD {}",
            unsigned_constraint_sql(table, &column.name)
        ));
    }

    if column.on_update_auto {
        statements.extend(touch_trigger_sql(table, &column.name));
    } else {
        statements.extend(drop_touch_trigger_sql(table, &column.name));
    }

    statements.push(comment_sql(
        &format!("COLUMN {table_q}.{column_q}"),
        column.comment.as_deref(),
    ));
    statements
}

/// Statements for one operation, in execution order.
pub fn render_ddl(op: &Operation) -> Vec<String> {
    match op {
        Operation::CreateTable { table } => create_table_sql(table),
        Operation::DropTable { table } => {
            vec![format!("DROP TABLE {}", quote_ident(table))]
        }
        Operation::AddColumn { table, column } => add_column_sql(table, column),
        Operation::ModifyColumn { table, column } => modify_column_sql(table, column),
        Operation::DropColumn { table, name } => {
            let mut statements = drop_touch_trigger_sql(table, name);
            statements.push(format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(name)
            ));
            statements
        }
        Operation::AddIndex { table, index } => vec![index_sql(table, index)],
        Operation::DropIndex { name, .. } => {
            vec![format!("DROP INDEX {}", quote_ident(name))]
        }
        Operation::AddConstraint {
            table,
            name,
            constraint,
        } => vec![format!(
            "ALTER TABLE {} ADD {}",
            quote_ident(table),
            constraint_sql(name, constraint)
        )],
        Operation::DropConstraint { table, name, .. } => vec![format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            quote_ident(table),
            quote_ident(name)
        )],
    }
}
