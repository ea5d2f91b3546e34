//! SQL expressions.

use crate::stmt::SelectStmt;
use crate::{ColumnName, ParamName, TableName};

/// A SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A parameter placeholder (e.g., $tablenames -> $1)
    Param(ParamName),
    /// A column reference
    Column(ColumnRef),
    /// A string literal
    String(String),
    /// An integer literal
    Int(i64),
    /// NULL
    Null,
    /// Binary operation (e.g., a = b, a AND b)
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },
    /// CAST(expr AS ty). The type is written verbatim.
    Cast { expr: Box<Expr>, ty: String },
    /// NOT EXISTS (subquery)
    NotExists(Box<SelectStmt>),
    /// COUNT(*)
    CountStar,
}

/// A column reference, optionally qualified with table/alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<TableName>,
    pub column: ColumnName,
}

impl ColumnRef {
    pub fn new(column: ColumnName) -> Self {
        Self {
            table: None,
            column,
        }
    }

    pub fn qualified(table: TableName, column: ColumnName) -> Self {
        Self {
            table: Some(table),
            column,
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Gt,
    And,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::Gt => ">",
            BinOp::And => "AND",
        }
    }
}

// Convenience constructors
impl Expr {
    pub fn param(name: impl Into<ParamName>) -> Self {
        Expr::Param(name.into())
    }

    pub fn column(name: impl Into<ColumnName>) -> Self {
        Expr::Column(ColumnRef::new(name.into()))
    }

    /// A column reference qualified by table or alias. `None` leaves it bare.
    pub fn column_of(table: Option<&str>, column: impl Into<ColumnName>) -> Self {
        match table {
            Some(table) => Expr::qualified_column(table, column),
            None => Expr::column(column),
        }
    }

    pub fn qualified_column(table: impl Into<TableName>, column: impl Into<ColumnName>) -> Self {
        Expr::Column(ColumnRef::qualified(table.into(), column.into()))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Expr::Int(n)
    }

    /// Create an equality expression: self = other
    pub fn eq(self, other: Expr) -> Self {
        Expr::BinOp {
            left: Box::new(self),
            op: BinOp::Eq,
            right: Box::new(other),
        }
    }

    /// Create a greater-than expression: self > other
    pub fn gt(self, other: Expr) -> Self {
        Expr::BinOp {
            left: Box::new(self),
            op: BinOp::Gt,
            right: Box::new(other),
        }
    }

    /// Create an AND expression: self AND other
    pub fn and(self, other: Expr) -> Self {
        Expr::BinOp {
            left: Box::new(self),
            op: BinOp::And,
            right: Box::new(other),
        }
    }

    /// Create IS NULL expression
    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    /// Create IS NOT NULL expression
    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// Create CAST(self AS ty)
    pub fn cast(self, ty: impl Into<String>) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            ty: ty.into(),
        }
    }

    /// Create NOT EXISTS (query)
    pub fn not_exists(query: SelectStmt) -> Self {
        Expr::NotExists(Box::new(query))
    }

    /// AND together all expressions, or `None` if there are none.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(Expr::and)
    }
}
