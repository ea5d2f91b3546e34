//! Render SQL AST to string.

use std::cell::RefCell;
use std::fmt;

use indexmap::IndexMap;

use crate::expr::{ColumnRef, Expr};
use crate::stmt::*;
use crate::{Ident, ParamName, RenderedSql, escape_string};

/// Assigns `$n` placeholders to parameter names in order of first use.
///
/// Rendering goes through `Display`, which only hands out `&self`, hence the
/// `RefCell`.
#[derive(Default)]
pub struct RenderContext {
    params: RefCell<IndexMap<ParamName, usize>>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The placeholder index for `name`; a name used twice binds once.
    fn param_idx(&self, name: &ParamName) -> usize {
        let mut params = self.params.borrow_mut();
        let next = params.len() + 1;
        *params.entry(name.clone()).or_insert(next)
    }

    fn into_params(self) -> Vec<ParamName> {
        self.params.into_inner().into_keys().collect()
    }
}

/// Wrapper for rendering a `Render` type via `Display`.
///
/// Allows using `write!(f, "{}", Fmt(ctx, &expr))` in format strings.
pub struct Fmt<'a, T: Render>(
    /// The rendering context for parameter tracking.
    &'a RenderContext,
    /// The value to render.
    &'a T,
);

impl<T: Render> fmt::Display for Fmt<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.1.render(self.0, f)
    }
}

/// Write `items` separated by `sep`.
fn join<I, T>(f: &mut fmt::Formatter<'_>, sep: &str, items: I) -> fmt::Result
where
    I: IntoIterator<Item = T>,
    T: fmt::Display,
{
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Trait for types that can be rendered to SQL.
pub trait Render {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl Render for Expr {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Param(name) => {
                let idx = ctx.param_idx(name);
                write!(f, "${idx}")
            }
            Expr::Column(col) => col.render(ctx, f),
            Expr::String(s) => {
                let escaped = escape_string(s);
                write!(f, "{escaped}")
            }
            Expr::Int(n) => write!(f, "{n}"),
            Expr::Null => write!(f, "NULL"),
            Expr::BinOp { left, op, right } => {
                let left = Fmt(ctx, left.as_ref());
                let right = Fmt(ctx, right.as_ref());
                let op = op.as_str();
                write!(f, "{left} {op} {right}")
            }
            Expr::IsNull { expr, negated } => {
                let expr = Fmt(ctx, expr.as_ref());
                let suffix = if *negated { " IS NOT NULL" } else { " IS NULL" };
                write!(f, "{expr}{suffix}")
            }
            Expr::Cast { expr, ty } => {
                let expr = Fmt(ctx, expr.as_ref());
                write!(f, "CAST({expr} AS {ty})")
            }
            Expr::NotExists(query) => {
                let query = Fmt(ctx, query.as_ref());
                write!(f, "NOT EXISTS ({query})")
            }
            Expr::CountStar => write!(f, "COUNT(*)"),
        }
    }
}

impl Render for ColumnRef {
    fn render(&self, _ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = &self.table {
            let table = Ident(table.as_str());
            write!(f, "{table}.")?;
        }
        let column = Ident(self.column.as_str());
        write!(f, "{column}")
    }
}

impl Render for SelectStmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT")?;
        if self.distinct {
            write!(f, " DISTINCT")?;
        }

        if self.columns.is_empty() {
            write!(f, " *")?;
        } else {
            f.write_str(" ")?;
            join(f, ", ", self.columns.iter().map(|c| Fmt(ctx, c)))?;
        }

        if let Some(from) = &self.from {
            write!(f, "\nFROM {}", Ident(from.table.as_str()))?;
            if let Some(alias) = &from.alias {
                write!(f, " {}", Ident(alias.as_str()))?;
            }
        }
        if let Some(where_) = &self.where_ {
            write!(f, "\nWHERE {}", Fmt(ctx, where_))?;
        }
        if !self.group_by.is_empty() {
            f.write_str("\nGROUP BY ")?;
            join(f, ", ", self.group_by.iter().map(|e| Fmt(ctx, e)))?;
        }
        if let Some(having) = &self.having {
            write!(f, "\nHAVING {}", Fmt(ctx, having))?;
        }
        if !self.order_by.is_empty() {
            f.write_str("\nORDER BY ")?;
            join(f, ", ", self.order_by.iter().map(|o| Fmt(ctx, o)))?;
        }
        if let Some(limit) = &self.limit {
            write!(f, "\nLIMIT {}", Fmt(ctx, limit))?;
        }
        Ok(())
    }
}

impl Render for OrderBy {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ASC", Fmt(ctx, &self.expr))
    }
}

impl Render for SelectColumn {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Fmt(ctx, &self.expr))?;
        match &self.alias {
            Some(alias) => write!(f, " AS {}", Ident(alias.as_str())),
            None => Ok(()),
        }
    }
}

impl Render for InsertStmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {} (", Ident(self.table.as_str()))?;
        join(f, ", ", self.columns.iter().map(|c| Ident(c.as_str())))?;
        f.write_str(")\nVALUES (")?;
        join(f, ", ", self.values.iter().map(|v| Fmt(ctx, v)))?;
        f.write_str(")")
    }
}

impl Render for UpdateStmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UPDATE {}\nSET ", Ident(self.table.as_str()))?;
        let assignments = self
            .assignments
            .iter()
            .map(|(column, value)| format!("{} = {}", Ident(column.as_str()), Fmt(ctx, value)));
        join(f, ", ", assignments)?;
        match &self.where_ {
            Some(where_) => write!(f, "\nWHERE {}", Fmt(ctx, where_)),
            None => Ok(()),
        }
    }
}

impl Render for DeleteStmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DELETE FROM {}", Ident(self.table.as_str()))?;
        if let Some(alias) = &self.alias {
            write!(f, " {}", Ident(alias.as_str()))?;
        }
        match &self.where_ {
            Some(where_) => write!(f, "\nWHERE {}", Fmt(ctx, where_)),
            None => Ok(()),
        }
    }
}

impl Render for AlterTableStmt {
    fn render(&self, _ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = Ident(self.table.as_str());
        write!(f, "ALTER TABLE {table}")?;
        match &self.action {
            AlterAction::AlterColumnType {
                column,
                ty,
                collation,
            } => {
                let column = Ident(column.as_str());
                write!(f, " ALTER COLUMN {column} TYPE {ty}")?;
                if let Some(collation) = collation {
                    let collation = Ident(collation.as_str());
                    write!(f, " COLLATE {collation}")?;
                }
                Ok(())
            }
        }
    }
}

/// Render a statement to SQL.
pub fn render(stmt: &impl Render) -> RenderedSql {
    let ctx = RenderContext::new();
    let sql = format!("{}", Fmt(&ctx, stmt));
    RenderedSql {
        sql,
        params: ctx.into_params(),
    }
}

#[cfg(test)]
mod tests;
