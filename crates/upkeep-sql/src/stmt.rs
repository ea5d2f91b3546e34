//! SQL statements.

use crate::expr::Expr;
use crate::{ColumnName, TableName};

/// A SELECT statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectStmt {
    pub distinct: bool,
    pub columns: Vec<SelectColumn>,
    pub from: Option<FromClause>,
    pub where_: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Expr>,
}

/// A column in a SELECT clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub expr: Expr,
    pub alias: Option<ColumnName>,
}

impl SelectColumn {
    pub fn expr(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<ColumnName>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }
}

/// A FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub table: TableName,
    pub alias: Option<TableName>,
}

impl FromClause {
    pub fn table(name: impl Into<TableName>) -> Self {
        Self {
            table: name.into(),
            alias: None,
        }
    }

    pub fn aliased(name: impl Into<TableName>, alias: impl Into<TableName>) -> Self {
        Self {
            table: name.into(),
            alias: Some(alias.into()),
        }
    }
}

/// One ascending ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
}

impl OrderBy {
    pub fn asc(expr: Expr) -> Self {
        Self { expr }
    }
}

/// An INSERT statement with a single VALUES row.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: TableName,
    pub columns: Vec<ColumnName>,
    pub values: Vec<Expr>,
}

/// An UPDATE statement. Right-hand sides see the row as it was before.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: TableName,
    pub assignments: Vec<(ColumnName, Expr)>,
    pub where_: Option<Expr>,
}

/// A DELETE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: TableName,
    pub alias: Option<TableName>,
    pub where_: Option<Expr>,
}

/// An ALTER TABLE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct AlterTableStmt {
    pub table: TableName,
    pub action: AlterAction,
}

/// What an ALTER TABLE does.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterAction {
    /// ALTER COLUMN c TYPE ty [COLLATE "x"]
    ///
    /// `ty` is written verbatim, so it must come from the catalog.
    AlterColumnType {
        column: ColumnName,
        ty: String,
        collation: Option<String>,
    },
}

impl SelectStmt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn column(mut self, col: SelectColumn) -> Self {
        self.columns.push(col);
        self
    }

    pub fn columns(mut self, cols: impl IntoIterator<Item = SelectColumn>) -> Self {
        self.columns.extend(cols);
        self
    }

    pub fn from(mut self, from: FromClause) -> Self {
        self.from = Some(from);
        self
    }

    pub fn where_(mut self, expr: Expr) -> Self {
        self.where_ = Some(expr);
        self
    }

    pub fn and_where(mut self, expr: Expr) -> Self {
        self.where_ = Some(match self.where_ {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn group_by(mut self, exprs: impl IntoIterator<Item = Expr>) -> Self {
        self.group_by.extend(exprs);
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(expr);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, expr: Expr) -> Self {
        self.limit = Some(expr);
        self
    }
}

impl InsertStmt {
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<ColumnName>, value: Expr) -> Self {
        self.columns.push(name.into());
        self.values.push(value);
        self
    }
}

impl UpdateStmt {
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            assignments: Vec::new(),
            where_: None,
        }
    }

    pub fn set(mut self, column: impl Into<ColumnName>, value: Expr) -> Self {
        self.assignments.push((column.into(), value));
        self
    }

    pub fn where_(mut self, expr: Expr) -> Self {
        self.where_ = Some(expr);
        self
    }
}

impl DeleteStmt {
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            alias: None,
            where_: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<TableName>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn where_(mut self, expr: Expr) -> Self {
        self.where_ = Some(expr);
        self
    }

    pub fn and_where(mut self, expr: Expr) -> Self {
        self.where_ = Some(match self.where_ {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }
}

impl AlterTableStmt {
    pub fn alter_column_type(
        table: impl Into<TableName>,
        column: impl Into<ColumnName>,
        ty: impl Into<String>,
        collation: Option<String>,
    ) -> Self {
        Self {
            table: table.into(),
            action: AlterAction::AlterColumnType {
                column: column.into(),
                ty: ty.into(),
                collation,
            },
        }
    }
}
