//! Parameterized statement construction.
//!
//! Builds dialect-correct SQL plus an ordered parameter list from entity
//! rows and [`Filter`] trees. Identifiers are validated before they are
//! quoted; literal values only ever travel as bind parameters.

use serde_json::{Map, Value};

use polystore_core::filter::{ensure_valid_identifier, Node};
use polystore_core::{Cond, DalResult, DataAccessError, Entity, Filter, Op, PageRequest, SoftDeleteFields};

use super::dialect::SqlDialect;

/// A statement plus its bind parameters, in placeholder order.
#[derive(Debug, Clone)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl BuiltQuery {
    fn new(sql: String, params: Vec<Value>) -> Self {
        Self { sql, params }
    }
}

fn table<E: Entity>(dialect: SqlDialect) -> String {
    dialect.quote(E::table())
}

fn id_column<E: Entity>(dialect: SqlDialect) -> String {
    dialect.quote(E::id_field())
}

pub fn select_all<E: Entity>(dialect: SqlDialect) -> BuiltQuery {
    BuiltQuery::new(format!("SELECT * FROM {}", table::<E>(dialect)), Vec::new())
}

pub fn select_by_id<E: Entity>(dialect: SqlDialect, id: Value) -> BuiltQuery {
    BuiltQuery::new(
        format!(
            "SELECT * FROM {} WHERE {} = {}",
            table::<E>(dialect),
            id_column::<E>(dialect),
            dialect.placeholder(1)
        ),
        vec![id],
    )
}

pub fn select_where<E: Entity>(dialect: SqlDialect, filter: &Filter) -> DalResult<BuiltQuery> {
    let mut params = Vec::new();
    let clause = render_filter(dialect, filter, &mut params)?;
    let sql = match clause {
        Some(clause) => format!("SELECT * FROM {} WHERE {clause}", table::<E>(dialect)),
        None => format!("SELECT * FROM {}", table::<E>(dialect)),
    };
    Ok(BuiltQuery::new(sql, params))
}

pub fn select_page<E: Entity>(
    dialect: SqlDialect,
    filter: Option<&Filter>,
    page: &PageRequest,
) -> DalResult<BuiltQuery> {
    let mut params = Vec::new();
    let clause = match filter {
        Some(filter) => render_filter(dialect, filter, &mut params)?,
        None => None,
    };

    let order_field = page.order_field().unwrap_or_else(|| E::id_field());
    ensure_valid_identifier(order_field)?;
    let direction = if page.is_descending() { "DESC" } else { "ASC" };

    let mut sql = format!("SELECT * FROM {}", table::<E>(dialect));
    if let Some(clause) = clause {
        sql.push_str(&format!(" WHERE {clause}"));
    }
    sql.push_str(&format!(
        " ORDER BY {} {direction} LIMIT {} OFFSET {}",
        dialect.quote(order_field),
        page.limit(),
        page.offset()
    ));
    Ok(BuiltQuery::new(sql, params))
}

pub fn count_where<E: Entity>(dialect: SqlDialect, filter: Option<&Filter>) -> DalResult<BuiltQuery> {
    let mut params = Vec::new();
    let clause = match filter {
        Some(filter) => render_filter(dialect, filter, &mut params)?,
        None => None,
    };
    let sql = match clause {
        Some(clause) => format!("SELECT COUNT(*) FROM {} WHERE {clause}", table::<E>(dialect)),
        None => format!("SELECT COUNT(*) FROM {}", table::<E>(dialect)),
    };
    Ok(BuiltQuery::new(sql, params))
}

pub fn exists_where<E: Entity>(dialect: SqlDialect, filter: &Filter) -> DalResult<BuiltQuery> {
    let mut params = Vec::new();
    let clause = render_filter(dialect, filter, &mut params)?;
    let sql = match clause {
        Some(clause) => format!(
            "SELECT 1 FROM {} WHERE {clause} LIMIT 1",
            table::<E>(dialect)
        ),
        None => format!("SELECT 1 FROM {} LIMIT 1", table::<E>(dialect)),
    };
    Ok(BuiltQuery::new(sql, params))
}

pub fn insert_one<E: Entity>(dialect: SqlDialect, row: &Map<String, Value>) -> DalResult<BuiltQuery> {
    insert_many::<E>(dialect, std::slice::from_ref(row))
}

/// Multi-row insert. Every row binds the first row's column set; the
/// placeholder index keeps counting across rows for engines that number
/// them.
pub fn insert_many<E: Entity>(
    dialect: SqlDialect,
    rows: &[Map<String, Value>],
) -> DalResult<BuiltQuery> {
    let Some(first) = rows.first() else {
        return Err(DataAccessError::validation("insert requires at least one row"));
    };

    let columns: Vec<&String> = first.keys().collect();
    for column in &columns {
        ensure_valid_identifier(column)?;
    }

    let column_list = columns
        .iter()
        .map(|c| dialect.quote(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut params = Vec::with_capacity(columns.len() * rows.len());
    let mut tuples = Vec::with_capacity(rows.len());
    let mut index = 1usize;
    for row in rows {
        let mut placeholders = Vec::with_capacity(columns.len());
        for column in &columns {
            params.push(row.get(*column).cloned().unwrap_or(Value::Null));
            placeholders.push(dialect.placeholder(index));
            index += 1;
        }
        tuples.push(format!("({})", placeholders.join(", ")));
    }

    let sql = format!(
        "INSERT INTO {} ({column_list}) VALUES {}",
        table::<E>(dialect),
        tuples.join(", ")
    );
    Ok(BuiltQuery::new(sql, params))
}

/// Full-row update addressed by the identity column.
pub fn update_full<E: Entity>(dialect: SqlDialect, row: &Map<String, Value>) -> DalResult<BuiltQuery> {
    let fields: Vec<&str> = row
        .keys()
        .map(String::as_str)
        .filter(|f| *f != E::id_field())
        .collect();
    update_fields::<E>(dialect, row, &fields)
}

/// Update only the named fields.
pub fn update_fields<E: Entity>(
    dialect: SqlDialect,
    row: &Map<String, Value>,
    fields: &[&str],
) -> DalResult<BuiltQuery> {
    if fields.is_empty() {
        return Err(DataAccessError::validation("update requires at least one field"));
    }

    let id_value = row.get(E::id_field()).cloned().ok_or_else(|| {
        DataAccessError::validation(format!(
            "{} row is missing its identity field '{}'",
            E::type_name(),
            E::id_field()
        ))
    })?;

    let mut params = Vec::with_capacity(fields.len() + 1);
    let mut assignments = Vec::with_capacity(fields.len());
    let mut index = 1usize;
    for field in fields {
        ensure_valid_identifier(field)?;
        if *field == E::id_field() {
            return Err(DataAccessError::validation(
                "the identity field cannot be updated",
            ));
        }
        let value = row.get(*field).cloned().ok_or_else(|| {
            DataAccessError::validation(format!("unknown field '{field}' in update"))
        })?;
        assignments.push(format!("{} = {}", dialect.quote(field), dialect.placeholder(index)));
        params.push(value);
        index += 1;
    }

    params.push(id_value);
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        table::<E>(dialect),
        assignments.join(", "),
        id_column::<E>(dialect),
        dialect.placeholder(index)
    );
    Ok(BuiltQuery::new(sql, params))
}

pub fn delete_by_id<E: Entity>(dialect: SqlDialect, id: Value) -> BuiltQuery {
    BuiltQuery::new(
        format!(
            "DELETE FROM {} WHERE {} = {}",
            table::<E>(dialect),
            id_column::<E>(dialect),
            dialect.placeholder(1)
        ),
        vec![id],
    )
}

pub fn delete_where<E: Entity>(dialect: SqlDialect, filter: &Filter) -> DalResult<BuiltQuery> {
    let mut params = Vec::new();
    let clause = render_filter(dialect, filter, &mut params)?;
    let sql = match clause {
        Some(clause) => format!("DELETE FROM {} WHERE {clause}", table::<E>(dialect)),
        None => format!("DELETE FROM {}", table::<E>(dialect)),
    };
    Ok(BuiltQuery::new(sql, params))
}

/// Write the soft-delete marker columns for one row.
pub fn soft_delete<E: Entity>(
    dialect: SqlDialect,
    fields: &SoftDeleteFields,
    id: Value,
    deleted_by: &str,
    deleted_at: &str,
) -> DalResult<BuiltQuery> {
    for field in [fields.flag, fields.deleted_at, fields.deleted_by] {
        ensure_valid_identifier(field)?;
    }
    let sql = format!(
        "UPDATE {} SET {} = {}, {} = {}, {} = {} WHERE {} = {}",
        table::<E>(dialect),
        dialect.quote(fields.flag),
        dialect.placeholder(1),
        dialect.quote(fields.deleted_at),
        dialect.placeholder(2),
        dialect.quote(fields.deleted_by),
        dialect.placeholder(3),
        id_column::<E>(dialect),
        dialect.placeholder(4)
    );
    Ok(BuiltQuery::new(
        sql,
        vec![
            Value::Bool(true),
            Value::String(deleted_at.to_string()),
            Value::String(deleted_by.to_string()),
            id,
        ],
    ))
}

/// Render a filter to a WHERE clause, pushing parameters in placeholder
/// order. `None` for an empty filter.
pub fn render_filter(
    dialect: SqlDialect,
    filter: &Filter,
    params: &mut Vec<Value>,
) -> DalResult<Option<String>> {
    let Some(root) = &filter.root else {
        return Ok(None);
    };
    let mut index = params.len() + 1;
    let clause = render_node(dialect, root, params, &mut index)?;
    Ok(Some(clause))
}

fn render_node(
    dialect: SqlDialect,
    node: &Node,
    params: &mut Vec<Value>,
    index: &mut usize,
) -> DalResult<String> {
    match node {
        Node::Cond(cond) => render_cond(dialect, cond, params, index),
        Node::And(nodes) => render_group(dialect, nodes, " AND ", params, index),
        Node::Or(nodes) => render_group(dialect, nodes, " OR ", params, index),
    }
}

fn render_group(
    dialect: SqlDialect,
    nodes: &[Node],
    joiner: &str,
    params: &mut Vec<Value>,
    index: &mut usize,
) -> DalResult<String> {
    let rendered: Vec<String> = nodes
        .iter()
        .map(|n| render_node(dialect, n, params, index))
        .collect::<DalResult<_>>()?;
    Ok(format!("({})", rendered.join(joiner)))
}

fn render_cond(
    dialect: SqlDialect,
    cond: &Cond,
    params: &mut Vec<Value>,
    index: &mut usize,
) -> DalResult<String> {
    ensure_valid_identifier(&cond.field)?;
    let column = dialect.quote(&cond.field);

    let mut bind = |value: &Value, params: &mut Vec<Value>, index: &mut usize| {
        params.push(value.clone());
        let placeholder = dialect.placeholder(*index);
        *index += 1;
        placeholder
    };

    let clause = match cond.op {
        Op::Eq => format!("{column} = {}", bind(&cond.value, params, index)),
        Op::Ne => format!("{column} <> {}", bind(&cond.value, params, index)),
        Op::Gt => format!("{column} > {}", bind(&cond.value, params, index)),
        Op::Ge => format!("{column} >= {}", bind(&cond.value, params, index)),
        Op::Lt => format!("{column} < {}", bind(&cond.value, params, index)),
        Op::Le => format!("{column} <= {}", bind(&cond.value, params, index)),
        Op::Like => format!("{column} LIKE {}", bind(&cond.value, params, index)),
        Op::In => {
            let Value::Array(values) = &cond.value else {
                return Err(DataAccessError::validation(format!(
                    "IN condition on '{}' requires an array value",
                    cond.field
                )));
            };
            if values.is_empty() {
                // empty IN never matches
                return Ok("1 = 0".to_string());
            }
            let placeholders: Vec<String> =
                values.iter().map(|v| bind(v, params, index)).collect();
            format!("{column} IN ({})", placeholders.join(", "))
        }
        Op::IsNull => format!("{column} IS NULL"),
        Op::NotNull => format!("{column} IS NOT NULL"),
    };
    Ok(clause)
}
