// Filter expression language over version attributes and labels
//
// Expressions parse into a small AST and lower in one pass to a SQL
// predicate over the `versions` table (aliased `v`), with label references
// becoming subqueries against the `labels` table.

use rusqlite::types::Value;

use crate::error::CatalogError;
use crate::Result;

mod parser;

pub use parser::parse;

/// Version columns addressable from a filter expression.
pub(crate) const VERSION_ATTRIBUTES: &[&str] = &[
    "id",
    "uid",
    "date",
    "volume",
    "snapshot",
    "size",
    "block_size",
    "storage_id",
    "status",
    "protected",
    "bytes_read",
    "bytes_written",
    "bytes_deduplicated",
    "bytes_sparse",
    "duration",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    /// The operator as seen from the other side of the comparison.
    fn flipped(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    /// A `versions` column, validated at parse time.
    Ident(String),
    /// A `labels["name"]` reference.
    Label(String),
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Atom {
    fn constant_string(&self) -> Option<String> {
        match self {
            Atom::Int(value) => Some(value.to_string()),
            Atom::Str(value) => Some(value.clone()),
            Atom::Bool(true) => Some("True".to_string()),
            Atom::Bool(false) => Some("False".to_string()),
            Atom::Ident(_) | Atom::Label(_) => None,
        }
    }

    fn constant_value(&self) -> Option<Value> {
        match self {
            Atom::Int(value) => Some(Value::Integer(*value)),
            Atom::Str(value) => Some(Value::Text(value.clone())),
            Atom::Bool(value) => Some(Value::Integer(i64::from(*value))),
            Atom::Ident(_) | Atom::Label(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Cmp(Atom, CmpOp, Atom),
    Atom(Atom),
}

/// Lower an expression to a WHERE fragment plus its bind values.
pub fn to_sql_predicate(expr: &Expr) -> Result<(String, Vec<Value>)> {
    let mut values = Vec::new();
    let sql = lower_expr(expr, &mut values)?;
    Ok((sql, values))
}

fn lower_expr(expr: &Expr, values: &mut Vec<Value>) -> Result<String> {
    match expr {
        Expr::Or(operands) => lower_boolean(operands, " OR ", values),
        Expr::And(operands) => lower_boolean(operands, " AND ", values),
        Expr::Not(inner) => Ok(format!("(NOT {})", lower_expr(inner, values)?)),
        Expr::Cmp(left, op, right) => lower_cmp(left, *op, right, values),
        Expr::Atom(atom) => lower_atom(atom, values),
    }
}

fn lower_boolean(operands: &[Expr], joiner: &str, values: &mut Vec<Value>) -> Result<String> {
    let parts = operands
        .iter()
        .map(|operand| lower_expr(operand, values))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", parts.join(joiner)))
}

/// A bare identifier tests for a non-empty column, a bare label for label
/// existence. A bare constant cannot reference the catalog and is a usage
/// error.
fn lower_atom(atom: &Atom, values: &mut Vec<Value>) -> Result<String> {
    match atom {
        Atom::Ident(column) => Ok(format!("v.{} != ''", column)),
        Atom::Label(name) => {
            values.push(Value::Text(name.clone()));
            Ok("v.id IN (SELECT version_id FROM labels WHERE name = ?)".to_string())
        }
        _ => Err(CatalogError::Usage(
            "Filter expression does not reference any version attribute.".to_string(),
        )),
    }
}

fn lower_cmp(left: &Atom, op: CmpOp, right: &Atom, values: &mut Vec<Value>) -> Result<String> {
    match (left, right) {
        (Atom::Ident(_), Atom::Label(_)) | (Atom::Label(_), Atom::Ident(_)) => {
            Err(CatalogError::Usage(
                "Comparing identifiers to labels is not supported.".to_string(),
            ))
        }
        (Atom::Label(_), Atom::Label(_)) => Err(CatalogError::Usage(
            "Comparing labels to labels is not supported.".to_string(),
        )),
        (Atom::Ident(a), Atom::Ident(b)) => Ok(format!("v.{} {} v.{}", a, op.as_sql(), b)),
        (Atom::Ident(column), constant) => {
            values.push(constant.constant_value().unwrap());
            Ok(format!("v.{} {} ?", column, op.as_sql()))
        }
        (constant, Atom::Ident(column)) => {
            values.push(constant.constant_value().unwrap());
            Ok(format!("v.{} {} ?", column, op.flipped().as_sql()))
        }
        (Atom::Label(name), constant) | (constant, Atom::Label(name)) => {
            if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                return Err(CatalogError::Usage(
                    "Ordered comparisons with labels are not supported.".to_string(),
                ));
            }
            values.push(Value::Text(name.clone()));
            values.push(Value::Text(constant.constant_string().unwrap()));
            Ok(format!(
                "v.id IN (SELECT version_id FROM labels WHERE name = ? AND value {} ?)",
                op.as_sql()
            ))
        }
        (left, _) => {
            debug_assert!(left.constant_string().is_some());
            Err(CatalogError::Usage(
                "Filter expression does not reference any version attribute.".to_string(),
            ))
        }
    }
}
