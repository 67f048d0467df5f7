//! Expression expander.
//!
//! Rewrites every compound expression and assignment into a sequence of
//! elementary single-opcode calls, preserving evaluation order.
//! Temporaries are always instrument-local (`#k0`, `#a1`, ...), never
//! global, so running this stage after lock insertion cannot change any
//! instrument's global read/write sets. Lock markers on a rewritten
//! statement carry over to every statement of its expansion; since they
//! name the same resources, coalescing later collapses them back into a
//! single bracket.

use std::collections::HashMap;

use crate::opcode::{OpcodeLibrary, Param};
use crate::syntax::ast::*;

/// Expand all instrument and opcode bodies. Expanding an already
/// elementary tree is a no-op.
pub fn expand(mut program: Program, library: &dyn OpcodeLibrary) -> Program {
    let udo_outs: HashMap<String, Vec<Rate>> = program
        .opcodes
        .iter()
        .map(|udo| (udo.name.clone(), udo.out_rates.clone()))
        .collect();
    let ctx = Expander {
        library,
        udo_outs,
        next_temp: 0,
    };
    let mut ctx = ctx;

    for instr in &mut program.instruments {
        ctx.next_temp = 0;
        let body = std::mem::take(&mut instr.body);
        instr.body = ctx.expand_body(body);
    }
    for udo in &mut program.opcodes {
        ctx.next_temp = 0;
        let body = std::mem::take(&mut udo.body);
        udo.body = ctx.expand_body(body);
    }
    program
}

struct Expander<'a> {
    library: &'a dyn OpcodeLibrary,
    udo_outs: HashMap<String, Vec<Rate>>,
    next_temp: u32,
}

impl Expander<'_> {
    fn expand_body(&mut self, body: Vec<Stmt>) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            self.expand_stmt(stmt, &mut out);
        }
        out
    }

    fn expand_stmt(&mut self, stmt: Stmt, out: &mut Vec<Stmt>) {
        let Stmt { kind, line, locks } = stmt;
        match kind {
            StmtKind::Assign { target, value } => {
                let mut pre = Vec::new();
                // The top-level operation writes the target directly; only
                // inner subexpressions need temporaries.
                match value {
                    Expr::Binary { op, lhs, rhs } => {
                        let lhs = self.flatten(*lhs, line, &mut pre);
                        let rhs = self.flatten(*rhs, line, &mut pre);
                        pre.push(Stmt::new(
                            StmtKind::Call {
                                outs: vec![target],
                                opcode: op.opcode().to_string(),
                                args: vec![lhs, rhs],
                            },
                            line,
                        ));
                    }
                    Expr::Unary { operand, .. } => {
                        let operand = self.flatten(*operand, line, &mut pre);
                        pre.push(Stmt::new(
                            StmtKind::Call {
                                outs: vec![target],
                                opcode: "neg".to_string(),
                                args: vec![operand],
                            },
                            line,
                        ));
                    }
                    Expr::Call { opcode, args } => {
                        let args = args
                            .into_iter()
                            .map(|a| self.flatten(a, line, &mut pre))
                            .collect();
                        pre.push(Stmt::new(
                            StmtKind::Call {
                                outs: vec![target],
                                opcode,
                                args,
                            },
                            line,
                        ));
                    }
                    atomic => {
                        pre.push(Stmt::new(
                            StmtKind::Call {
                                outs: vec![target],
                                opcode: "assign".to_string(),
                                args: vec![atomic],
                            },
                            line,
                        ));
                    }
                }
                push_with_locks(pre, &locks, out);
            }
            StmtKind::Call { outs, opcode, args } => {
                let mut pre = Vec::new();
                let args = args
                    .into_iter()
                    .map(|a| self.flatten(a, line, &mut pre))
                    .collect();
                pre.push(Stmt::new(StmtKind::Call { outs, opcode, args }, line));
                push_with_locks(pre, &locks, out);
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let mut pre = Vec::new();
                let cond = self.flatten(cond, line, &mut pre);
                push_with_locks(pre, &locks, out);
                let then_body = self.expand_body(then_body);
                let else_body = self.expand_body(else_body);
                out.push(Stmt {
                    kind: StmtKind::If {
                        cond,
                        then_body,
                        else_body,
                    },
                    line,
                    locks,
                });
            }
            StmtKind::While { cond, body } => {
                // The condition is recomputed at the end of each
                // iteration so the flattened form evaluates it exactly
                // where the source did.
                let mut pre = Vec::new();
                let cond = self.flatten(cond, line, &mut pre);
                let mut body = self.expand_body(body);
                // The recomputation reads the same resources as the
                // condition, so it carries the same lock markers.
                for stmt in &pre {
                    let mut recompute = stmt.clone();
                    recompute.locks = locks.clone();
                    body.push(recompute);
                }
                push_with_locks(pre, &locks, out);
                out.push(Stmt {
                    kind: StmtKind::While { cond, body },
                    line,
                    locks,
                });
            }
            other @ (StmtKind::Label(_) | StmtKind::Goto(_)) => {
                out.push(Stmt {
                    kind: other,
                    line,
                    locks,
                });
            }
        }
    }

    /// Reduce `expr` to an atomic expression, appending the elementary
    /// calls that compute it to `pre`.
    fn flatten(&mut self, expr: Expr, line: usize, pre: &mut Vec<Stmt>) -> Expr {
        match expr {
            atomic @ (Expr::Number(_) | Expr::Str(_) | Expr::Var(_)) => atomic,
            Expr::Unary { operand, .. } => {
                let operand = self.flatten(*operand, line, pre);
                let temp = self.fresh_temp(self.rate_of_atom(&operand));
                pre.push(Stmt::new(
                    StmtKind::Call {
                        outs: vec![temp.clone()],
                        opcode: "neg".to_string(),
                        args: vec![operand],
                    },
                    line,
                ));
                Expr::Var(temp)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.flatten(*lhs, line, pre);
                let rhs = self.flatten(*rhs, line, pre);
                let rate = if is_comparison(op) {
                    Rate::Control
                } else {
                    max_rate(self.rate_of_atom(&lhs), self.rate_of_atom(&rhs))
                };
                let temp = self.fresh_temp(rate);
                pre.push(Stmt::new(
                    StmtKind::Call {
                        outs: vec![temp.clone()],
                        opcode: op.opcode().to_string(),
                        args: vec![lhs, rhs],
                    },
                    line,
                ));
                Expr::Var(temp)
            }
            Expr::Call { opcode, args } => {
                let args: Vec<Expr> = args
                    .into_iter()
                    .map(|a| self.flatten(a, line, pre))
                    .collect();
                let rate = self.call_rate(&opcode, &args);
                let temp = self.fresh_temp(rate);
                pre.push(Stmt::new(
                    StmtKind::Call {
                        outs: vec![temp.clone()],
                        opcode,
                        args,
                    },
                    line,
                ));
                Expr::Var(temp)
            }
        }
    }

    fn fresh_temp(&mut self, rate: Rate) -> String {
        let letter = match rate {
            Rate::Audio => 'a',
            Rate::Control => 'k',
            Rate::Init => 'i',
            Rate::Str => 'S',
        };
        let name = format!("#{letter}{}", self.next_temp);
        self.next_temp += 1;
        name
    }

    fn rate_of_atom(&self, expr: &Expr) -> Rate {
        match expr {
            Expr::Number(_) => Rate::Init,
            Expr::Str(_) => Rate::Str,
            Expr::Var(name) => Rate::of_name(name).unwrap_or(Rate::Control),
            // Non-atomic operands never reach here; flatten handles them.
            _ => Rate::Control,
        }
    }

    fn call_rate(&self, opcode: &str, args: &[Expr]) -> Rate {
        if let Some(outs) = self.udo_outs.get(opcode) {
            return outs.first().copied().unwrap_or(Rate::Init);
        }
        if let Some(info) = self.library.lookup(opcode) {
            if let Some(sig) = info
                .signatures
                .iter()
                .find(|s| s.ins.len() == args.len() && !s.outs.is_empty())
            {
                return match sig.outs[0] {
                    Param::Rate(r) => r,
                    Param::Any => args
                        .iter()
                        .map(|a| self.rate_of_atom(a))
                        .fold(Rate::Init, max_rate),
                };
            }
        }
        Rate::Control
    }
}

fn is_comparison(op: BinOp) -> bool {
    matches!(
        op,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
    )
}

fn max_rate(a: Rate, b: Rate) -> Rate {
    crate::sema::max_rate(a, b)
}

fn push_with_locks(stmts: Vec<Stmt>, locks: &[String], out: &mut Vec<Stmt>) {
    for mut stmt in stmts {
        stmt.locks = locks.to_vec();
        out.push(stmt);
    }
}
