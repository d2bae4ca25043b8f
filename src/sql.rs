use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectNamePart,
    SelectItem, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::Ms;

/// Parsed command from SQL input. The acting user is the session's login,
/// never a value in the statement.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser {
        name: Option<String>,
        image: Option<String>,
    },
    SelectUser,
    InsertBooking {
        residency_id: String,
        date: Ms,
    },
    SelectBookings,
    DeleteBooking {
        residency_id: String,
    },
    ToggleFavorite {
        residency_id: String,
    },
    SelectFavorites,
}

pub const TOGGLE_FAVORITE_FN: &str = "toggle_favorite";

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = single_insert_row(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    if !columns.is_empty() && columns.len() != row.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            columns.len(),
            row.len()
        )));
    }

    match table.as_str() {
        "users" => {
            let values = bind_columns(&columns, row, &["name", "image"])?;
            Ok(Command::RegisterUser {
                name: values[0].map(parse_string_or_null).transpose()?.flatten(),
                image: values[1].map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => {
            let values = bind_columns(&columns, row, &["residency_id", "date"])?;
            let residency_id = values[0].ok_or(SqlError::MissingValue("residency_id"))?;
            let date = values[1].ok_or(SqlError::MissingValue("date"))?;
            Ok(Command::InsertBooking {
                residency_id: parse_string(residency_id)?,
                date: parse_date(date)?,
            })
        }
        "favorites" => Err(SqlError::Unsupported(format!(
            "INSERT INTO favorites; use SELECT {TOGGLE_FAVORITE_FN}(residency_id)"
        ))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Line up VALUES with `expected` columns. Without a column list, values are
/// positional. `id` is accepted as an alias of `residency_id`.
fn bind_columns<'a>(
    columns: &[String],
    row: &'a [Expr],
    expected: &[&'static str],
) -> Result<Vec<Option<&'a Expr>>, SqlError> {
    if columns.is_empty() {
        if row.len() > expected.len() {
            return Err(SqlError::WrongArity(expected.len(), row.len()));
        }
        return Ok((0..expected.len()).map(|i| row.get(i)).collect());
    }

    let mut bound = vec![None; expected.len()];
    for (col, expr) in columns.iter().zip(row) {
        let name = if col == "id" { "residency_id" } else { col.as_str() };
        let slot = expected
            .iter()
            .position(|e| *e == name)
            .ok_or_else(|| SqlError::UnknownColumn(col.clone()))?;
        bound[slot] = Some(expr);
    }
    Ok(bound)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            residency_id: extract_where_residency_id(&delete.selection)?,
        }),
        "users" | "favorites" => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return parse_function_call(&select.projection);
    }

    let table = table_factor_name(&select.from[0].relation)?;
    match table.as_str() {
        "users" => Ok(Command::SelectUser),
        "bookings" => Ok(Command::SelectBookings),
        "favorites" => Ok(Command::SelectFavorites),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SELECT toggle_favorite('R1')`
fn parse_function_call(projection: &[SelectItem]) -> Result<Command, SqlError> {
    let expr = match projection.first() {
        Some(SelectItem::UnnamedExpr(expr)) | Some(SelectItem::ExprWithAlias { expr, .. }) => expr,
        _ => return Err(SqlError::Parse("SELECT without FROM".into())),
    };
    let Expr::Function(func) = expr else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };

    let name = object_name_last(&func.name).unwrap_or_default();
    if name != TOGGLE_FAVORITE_FN {
        return Err(SqlError::UnknownFunction(name));
    }
    let args = match &func.args {
        FunctionArguments::List(list) => &list.args,
        _ => return Err(SqlError::WrongArity(1, 0)),
    };
    if args.len() != 1 {
        return Err(SqlError::WrongArity(1, args.len()));
    }
    match &args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(arg)) => Ok(Command::ToggleFavorite {
            residency_id: parse_string(arg)?,
        }),
        other => Err(SqlError::Parse(format!("unsupported argument: {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn single_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_residency_id(selection: &Option<Expr>) -> Result<String, SqlError> {
    let sel = selection
        .as_ref()
        .ok_or(SqlError::MissingFilter("residency_id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left).as_deref() {
            Some("residency_id") | Some("id") => parse_string(right),
            _ => Err(SqlError::MissingFilter("residency_id")),
        },
        _ => Err(SqlError::MissingFilter("residency_id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

/// Integer milliseconds, or a string holding milliseconds, an RFC 3339
/// timestamp, or a `YYYY-MM-DD` date taken as midnight UTC.
fn parse_date(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(n, _)) => n
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad date: {e}"))),
        Some(Value::SingleQuotedString(s)) => parse_date_str(s),
        Some(value) => Err(SqlError::Parse(format!("expected date, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

pub fn parse_date_str(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(midnight) = day.and_hms_opt(0, 0, 0)
    {
        return Ok(midnight.and_utc().timestamp_millis());
    }
    Err(SqlError::Parse(format!("bad date: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    UnknownFunction(String),
    WrongArity(usize, usize),
    MissingValue(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::UnknownFunction(name) => write!(f, "unknown function: {name}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
