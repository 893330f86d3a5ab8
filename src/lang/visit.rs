//! Read-only traversal over the syntax tree.
//!
//! Implementors override `visit_stmt` / `visit_expr` for the node kinds they
//! care about and call the matching `walk_*` function to descend. Returning
//! `ControlFlow::Break` stops the whole traversal.

use std::convert::Infallible;
use std::ops::ControlFlow;

use super::ast::{Alias, Expr, Module, Stmt, StmtKind, Target};

pub trait Visitor: Sized {
    type Break;

    fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<Self::Break> {
        walk_stmt(self, stmt)
    }

    fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        walk_expr(self, expr)
    }

    fn visit_alias(&mut self, _alias: &Alias) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }
}

pub fn walk_module<V: Visitor>(visitor: &mut V, module: &Module) -> ControlFlow<V::Break> {
    walk_block(visitor, &module.body)
}

fn walk_block<V: Visitor>(visitor: &mut V, body: &[Stmt]) -> ControlFlow<V::Break> {
    for stmt in body {
        visitor.visit_stmt(stmt)?;
    }
    ControlFlow::Continue(())
}

fn walk_target<V: Visitor>(visitor: &mut V, target: &Target) -> ControlFlow<V::Break> {
    match target {
        Target::Name(_) => ControlFlow::Continue(()),
        Target::Subscript { value, index } => {
            visitor.visit_expr(value)?;
            visitor.visit_expr(index)
        }
    }
}

pub fn walk_stmt<V: Visitor>(visitor: &mut V, stmt: &Stmt) -> ControlFlow<V::Break> {
    match &stmt.kind {
        StmtKind::Expr(expr) => visitor.visit_expr(expr),
        StmtKind::Assign { target, value } | StmtKind::AugAssign { target, value, .. } => {
            walk_target(visitor, target)?;
            visitor.visit_expr(value)
        }
        StmtKind::FunctionDef { body, .. } => walk_block(visitor, body),
        StmtKind::Return(value) => match value {
            Some(value) => visitor.visit_expr(value),
            None => ControlFlow::Continue(()),
        },
        StmtKind::If { test, body, orelse } => {
            visitor.visit_expr(test)?;
            walk_block(visitor, body)?;
            walk_block(visitor, orelse)
        }
        StmtKind::While { test, body } => {
            visitor.visit_expr(test)?;
            walk_block(visitor, body)
        }
        StmtKind::For { iter, body, .. } => {
            visitor.visit_expr(iter)?;
            walk_block(visitor, body)
        }
        StmtKind::Import(names) | StmtKind::ImportFrom { names, .. } => {
            for alias in names {
                visitor.visit_alias(alias)?;
            }
            ControlFlow::Continue(())
        }
        StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Pass
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_) => ControlFlow::Continue(()),
    }
}

pub fn walk_expr<V: Visitor>(visitor: &mut V, expr: &Expr) -> ControlFlow<V::Break> {
    match expr {
        Expr::Int(_)
        | Expr::Float(_)
        | Expr::Str(_)
        | Expr::Bool(_)
        | Expr::None
        | Expr::Name(_) => ControlFlow::Continue(()),
        Expr::List(items) => {
            for item in items {
                visitor.visit_expr(item)?;
            }
            ControlFlow::Continue(())
        }
        Expr::Unary { operand, .. } => visitor.visit_expr(operand),
        Expr::Binary { left, right, .. }
        | Expr::Compare { left, right, .. }
        | Expr::BoolOp { left, right, .. } => {
            visitor.visit_expr(left)?;
            visitor.visit_expr(right)
        }
        Expr::Call { func, args } => {
            visitor.visit_expr(func)?;
            for arg in args {
                visitor.visit_expr(arg)?;
            }
            ControlFlow::Continue(())
        }
        Expr::Attribute { value, .. } => visitor.visit_expr(value),
        Expr::Subscript { value, index } => {
            visitor.visit_expr(value)?;
            visitor.visit_expr(index)
        }
        Expr::Lambda { body, .. } => visitor.visit_expr(body),
        Expr::IfExp { test, body, orelse } => {
            visitor.visit_expr(test)?;
            visitor.visit_expr(body)?;
            visitor.visit_expr(orelse)
        }
    }
}

/// Node count and maximum nesting depth of a module. The module itself is a
/// node at depth 0; every statement, expression and import alias is a node
/// one level below its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub nodes: usize,
    pub max_depth: usize,
    depth: usize,
}

impl TreeStats {
    pub fn of(module: &Module) -> Self {
        let mut stats = TreeStats {
            nodes: 1,
            ..TreeStats::default()
        };
        let _ = walk_module(&mut stats, module);
        stats
    }

    fn enter(&mut self) {
        self.nodes += 1;
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
    }
}

impl Visitor for TreeStats {
    type Break = Infallible;

    fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<Infallible> {
        self.enter();
        let flow = walk_stmt(self, stmt);
        self.depth -= 1;
        flow
    }

    fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<Infallible> {
        self.enter();
        let flow = walk_expr(self, expr);
        self.depth -= 1;
        flow
    }

    fn visit_alias(&mut self, _alias: &Alias) -> ControlFlow<Infallible> {
        self.enter();
        self.depth -= 1;
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse;

    #[test]
    fn counts_nodes_and_depth() {
        // Module > Assign > Binary > (Int, Int)
        let stats = TreeStats::of(&parse("x = 1 + 2").unwrap());
        assert_eq!(stats.nodes, 5);
        assert_eq!(stats.max_depth, 3);
    }

    #[test]
    fn nested_blocks_deepen_the_tree() {
        let flat = TreeStats::of(&parse("a = 1").unwrap());
        let nested = TreeStats::of(&parse("if True:\n    if True:\n        a = 1\n").unwrap());
        assert!(nested.max_depth > flat.max_depth + 1);
    }

    #[test]
    fn empty_module_is_a_single_node() {
        let stats = TreeStats::of(&parse("").unwrap());
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.max_depth, 0);
    }
}
