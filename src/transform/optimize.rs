//! Local tree simplification.
//!
//! Constant folding over elementary arithmetic, literal-condition branch
//! elimination, and removal of writes that nothing reads. Passes run to a
//! fixpoint, so the optimizer is idempotent and a no-op on already
//! optimal trees. It never changes observable behavior: globals and
//! lock-marked statements are left alone.

use tracing::debug;

use crate::syntax::ast::*;

/// Optimize every instrument and opcode body.
pub fn optimize(mut program: Program) -> Program {
    for instr in &mut program.instruments {
        let mut body = std::mem::take(&mut instr.body);
        let mut rounds = 0;
        while optimize_body(&mut body) {
            rounds += 1;
        }
        if rounds > 0 {
            debug!(instr = instr.id, rounds, "optimizer rewrote body");
        }
        instr.body = body;
    }
    for udo in &mut program.opcodes {
        let mut body = std::mem::take(&mut udo.body);
        while optimize_body(&mut body) {}
        udo.body = body;
    }
    program
}

/// One optimization round; true when anything changed.
fn optimize_body(body: &mut Vec<Stmt>) -> bool {
    let mut changed = fold_constants(body);
    changed |= propagate_literal_temps(body);
    changed |= eliminate_dead_branches(body);
    changed |= remove_dead_writes(body);
    changed
}

fn is_arith(op: &str) -> bool {
    matches!(op, "add" | "sub" | "mul" | "div" | "pow" | "mod" | "neg")
}

fn is_comparison(op: &str) -> bool {
    matches!(op, "eq" | "ne" | "lt" | "le" | "gt" | "ge")
}

fn is_pure(op: &str) -> bool {
    op == "assign" || is_arith(op) || is_comparison(op)
}

fn apply(op: &str, a: f64, b: f64) -> Option<f64> {
    let v = match op {
        "add" => a + b,
        "sub" => a - b,
        "mul" => a * b,
        "div" => {
            if b == 0.0 {
                // Division by a literal zero is left for the runtime to
                // report; folding it away would hide the fault.
                return None;
            }
            a / b
        }
        "pow" => a.powf(b),
        "mod" => {
            if b == 0.0 {
                return None;
            }
            a % b
        }
        "eq" => (a == b) as u8 as f64,
        "ne" => (a != b) as u8 as f64,
        "lt" => (a < b) as u8 as f64,
        "le" => (a <= b) as u8 as f64,
        "gt" => (a > b) as u8 as f64,
        "ge" => (a >= b) as u8 as f64,
        _ => return None,
    };
    Some(v)
}

/// Elementary calls over literal operands become plain assignments.
fn fold_constants(body: &mut [Stmt]) -> bool {
    let mut changed = false;
    for stmt in body.iter_mut() {
        match &mut stmt.kind {
            StmtKind::Call { outs, opcode, args } if outs.len() == 1 => {
                let folded = match (opcode.as_str(), args.as_slice()) {
                    (op, [Expr::Number(a), Expr::Number(b)]) if is_arith(op) || is_comparison(op) => {
                        apply(op, *a, *b)
                    }
                    ("neg", [Expr::Number(a)]) => Some(-a),
                    _ => None,
                };
                if let Some(v) = folded {
                    *opcode = "assign".to_string();
                    *args = vec![Expr::Number(v)];
                    changed = true;
                }
            }
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                changed |= fold_constants(then_body);
                changed |= fold_constants(else_body);
            }
            StmtKind::While { body, .. } => {
                changed |= fold_constants(body);
            }
            _ => {}
        }
    }
    changed
}

/// Substitute reads of single-write literal temporaries.
///
/// Only compiler temporaries (`#` prefix) qualify: they are defined
/// immediately before their uses by construction, so a global
/// substitution within the body is order-safe. Bodies containing labels
/// or gotos are skipped outright.
fn propagate_literal_temps(body: &mut [Stmt]) -> bool {
    if has_jumps(body) {
        return false;
    }
    let mut writes: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    count_writes(body, &mut writes);

    let mut literals: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
    collect_literal_temps(body, &writes, &mut literals);
    if literals.is_empty() {
        return false;
    }
    substitute_reads(body, &literals)
}

fn has_jumps(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Label(_) | StmtKind::Goto(_) => true,
        StmtKind::If {
            then_body,
            else_body,
            ..
        } => has_jumps(then_body) || has_jumps(else_body),
        StmtKind::While { body, .. } => has_jumps(body),
        _ => false,
    })
}

fn count_writes(body: &[Stmt], writes: &mut std::collections::HashMap<String, u32>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { target, .. } => {
                *writes.entry(target.clone()).or_default() += 1;
            }
            StmtKind::Call { outs, .. } => {
                for out in outs {
                    *writes.entry(out.clone()).or_default() += 1;
                }
            }
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                count_writes(then_body, writes);
                count_writes(else_body, writes);
            }
            StmtKind::While { body, .. } => count_writes(body, writes),
            _ => {}
        }
    }
}

fn collect_literal_temps(
    body: &[Stmt],
    writes: &std::collections::HashMap<String, u32>,
    literals: &mut std::collections::HashMap<String, f64>,
) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Call { outs, opcode, args } => {
                if opcode == "assign" && outs.len() == 1 && outs[0].starts_with('#') {
                    if let [Expr::Number(v)] = args.as_slice() {
                        if writes.get(&outs[0]).copied() == Some(1) {
                            literals.insert(outs[0].clone(), *v);
                        }
                    }
                }
            }
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                collect_literal_temps(then_body, writes, literals);
                collect_literal_temps(else_body, writes, literals);
            }
            StmtKind::While { body, .. } => collect_literal_temps(body, writes, literals),
            _ => {}
        }
    }
}

fn substitute_reads(
    body: &mut [Stmt],
    literals: &std::collections::HashMap<String, f64>,
) -> bool {
    let mut changed = false;
    for stmt in body.iter_mut() {
        match &mut stmt.kind {
            StmtKind::Assign { value, .. } => {
                changed |= substitute_expr(value, literals);
            }
            StmtKind::Call { args, .. } => {
                for arg in args {
                    changed |= substitute_expr(arg, literals);
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                changed |= substitute_expr(cond, literals);
                changed |= substitute_reads(then_body, literals);
                changed |= substitute_reads(else_body, literals);
            }
            StmtKind::While { cond, body } => {
                changed |= substitute_expr(cond, literals);
                changed |= substitute_reads(body, literals);
            }
            _ => {}
        }
    }
    changed
}

fn substitute_expr(
    expr: &mut Expr,
    literals: &std::collections::HashMap<String, f64>,
) -> bool {
    match expr {
        Expr::Var(name) => {
            if let Some(v) = literals.get(name) {
                *expr = Expr::Number(*v);
                return true;
            }
            false
        }
        Expr::Unary { operand, .. } => substitute_expr(operand, literals),
        Expr::Binary { lhs, rhs, .. } => {
            substitute_expr(lhs, literals) | substitute_expr(rhs, literals)
        }
        Expr::Call { args, .. } => {
            let mut changed = false;
            for arg in args {
                changed |= substitute_expr(arg, literals);
            }
            changed
        }
        _ => false,
    }
}

fn contains_label(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Label(_) => true,
        StmtKind::If {
            then_body,
            else_body,
            ..
        } => contains_label(then_body) || contains_label(else_body),
        StmtKind::While { body, .. } => contains_label(body),
        _ => false,
    })
}

/// `if <literal> then` keeps only the taken branch; `while 0 do` drops
/// the loop entirely. A branch holding a label is never discarded, since
/// a goto elsewhere may target it.
fn eliminate_dead_branches(body: &mut Vec<Stmt>) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < body.len() {
        let replacement = match &mut body[i].kind {
            StmtKind::If {
                cond: Expr::Number(n),
                then_body,
                else_body,
            } => {
                let (taken, dropped) = if *n != 0.0 {
                    (then_body, &*else_body)
                } else {
                    (else_body, &*then_body)
                };
                if contains_label(dropped) {
                    None
                } else {
                    Some(std::mem::take(taken))
                }
            }
            StmtKind::While {
                cond: Expr::Number(n),
                body: inner,
            } if *n == 0.0 && !contains_label(inner) => Some(Vec::new()),
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                changed |= eliminate_dead_branches(then_body);
                changed |= eliminate_dead_branches(else_body);
                None
            }
            StmtKind::While { body: inner, .. } => {
                changed |= eliminate_dead_branches(inner);
                None
            }
            _ => None,
        };
        match replacement {
            Some(stmts) => {
                let n = stmts.len();
                body.splice(i..=i, stmts);
                changed = true;
                i += n;
            }
            None => i += 1,
        }
    }
    changed
}

/// Drop pure single-result calls whose result nothing reads.
///
/// Globals are never dropped (another instrument may read them), and a
/// lock-marked statement is never dropped: removing a guarded side
/// effect could change what the critical section protects.
fn remove_dead_writes(body: &mut Vec<Stmt>) -> bool {
    let mut reads = std::collections::HashSet::new();
    collect_reads(body, &mut reads);
    prune_dead(body, &reads)
}

fn collect_reads(body: &[Stmt], reads: &mut std::collections::HashSet<String>) {
    fn expr_reads(expr: &Expr, reads: &mut std::collections::HashSet<String>) {
        match expr {
            Expr::Var(name) => {
                reads.insert(name.clone());
            }
            Expr::Unary { operand, .. } => expr_reads(operand, reads),
            Expr::Binary { lhs, rhs, .. } => {
                expr_reads(lhs, reads);
                expr_reads(rhs, reads);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    expr_reads(arg, reads);
                }
            }
            _ => {}
        }
    }
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { value, .. } => expr_reads(value, reads),
            StmtKind::Call { args, .. } => {
                for arg in args {
                    expr_reads(arg, reads);
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                expr_reads(cond, reads);
                collect_reads(then_body, reads);
                collect_reads(else_body, reads);
            }
            StmtKind::While { cond, body } => {
                expr_reads(cond, reads);
                collect_reads(body, reads);
            }
            _ => {}
        }
    }
}

fn prune_dead(body: &mut Vec<Stmt>, reads: &std::collections::HashSet<String>) -> bool {
    let mut changed = false;
    body.retain(|stmt| {
        let dead = match &stmt.kind {
            StmtKind::Call { outs, opcode, .. } => {
                outs.len() == 1
                    && is_pure(opcode)
                    && stmt.locks.is_empty()
                    && !is_global_name(&outs[0])
                    && !reads.contains(&outs[0])
            }
            _ => false,
        };
        if dead {
            changed = true;
        }
        !dead
    });
    for stmt in body.iter_mut() {
        match &mut stmt.kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                changed |= prune_dead(then_body, reads);
                changed |= prune_dead(else_body, reads);
            }
            StmtKind::While { body, .. } => {
                changed |= prune_dead(body, reads);
            }
            _ => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpcodeTable;
    use crate::syntax::lexer::Lexer;
    use crate::syntax::parser::Parser;
    use crate::syntax::symbol::SymbolTable;
    use crate::transform::expand;

    fn optimized(src: &str) -> Program {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut symbols = SymbolTable::new();
        let program = Parser::new(tokens).parse(&mut symbols).unwrap();
        let program = expand::expand(program, &OpcodeTable::builtin());
        optimize(program)
    }

    #[test]
    fn folds_literal_arithmetic_to_a_single_write() {
        // kx = 2 * 3 + 1 collapses to kx <- 7 at fixpoint
        let program = optimized("instr 1\nkx = 2 * 3 + 1\nout oscil(kx, 440)\nendin\n");
        let body = &program.instruments[0].body;
        match &body[0].kind {
            StmtKind::Call { opcode, args, outs } => {
                assert_eq!(opcode, "assign");
                assert_eq!(args[0], Expr::Number(7.0));
                assert_eq!(outs, &["kx".to_string()]);
            }
            other => panic!("expected assign, got {other:?}"),
        }
        // No arithmetic survives, and the temporaries are gone with it
        assert!(!body.iter().any(|s| matches!(
            &s.kind,
            StmtKind::Call { opcode, .. } if is_arith(opcode)
        )));
    }

    #[test]
    fn literal_false_branch_removed() {
        let src = "instr 1\nif 0 then\nkx = 1\nout oscil(kx, 440)\nendif\nkz = 2\nout oscil(kz, 220)\nendin\n";
        let program = optimized(src);
        let body = &program.instruments[0].body;
        assert!(body.iter().all(|s| !matches!(s.kind, StmtKind::If { .. })));
        // Only the kz path remains
        assert!(body.iter().any(|s| matches!(
            &s.kind,
            StmtKind::Call { outs, .. } if outs.first().map(String::as_str) == Some("kz")
        )));
        assert!(!body.iter().any(|s| matches!(
            &s.kind,
            StmtKind::Call { outs, .. } if outs.first().map(String::as_str) == Some("kx")
        )));
    }

    #[test]
    fn literal_true_branch_inlined() {
        let src = "instr 1\nif 1 then\nkx = 2\nendif\nout oscil(kx, 440)\nendin\n";
        let program = optimized(src);
        let body = &program.instruments[0].body;
        assert!(body.iter().all(|s| !matches!(s.kind, StmtKind::If { .. })));
        assert!(body.iter().any(|s| matches!(
            &s.kind,
            StmtKind::Call { outs, .. } if outs.first().map(String::as_str) == Some("kx")
        )));
    }

    #[test]
    fn dead_temp_removed() {
        // The comparison collapses to a literal; its temp write must not
        // survive.
        let src = "instr 1\nif 2 > 1 then\nkx = 1\nendif\nout oscil(kx, 440)\nendin\n";
        let program = optimized(src);
        let body = &program.instruments[0].body;
        assert!(
            !body.iter().any(|s| matches!(
                &s.kind,
                StmtKind::Call { outs, .. } if outs.first().is_some_and(|o| o.starts_with('#'))
            )),
            "dead temp survived: {body:?}"
        );
    }

    #[test]
    fn unread_local_assignment_removed() {
        let src = "instr 1\nkunused = 5\nout oscil(0.3, 440)\nendin\n";
        let program = optimized(src);
        let body = &program.instruments[0].body;
        assert_eq!(body.len(), 2); // oscil temp + out
    }

    #[test]
    fn global_write_never_removed() {
        let src = "instr 1\ngkx = 5\nout oscil(0.3, 440)\nendin\n";
        let program = optimized(src);
        let body = &program.instruments[0].body;
        assert!(body.iter().any(|s| matches!(
            &s.kind,
            StmtKind::Call { outs, .. } if outs.first().map(String::as_str) == Some("gkx")
        )));
    }

    #[test]
    fn lock_marked_write_never_removed() {
        let src = "instr 1\nkdead = 5\nendin\n";
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut symbols = SymbolTable::new();
        let mut program = Parser::new(tokens).parse(&mut symbols).unwrap();
        program.instruments[0].body[0].locks = vec!["gkx".to_string()];
        let program = optimize(program);
        assert_eq!(program.instruments[0].body.len(), 1);
    }

    #[test]
    fn division_by_zero_not_folded() {
        let src = "instr 1\nkx = 1 / 0\nout oscil(kx, 440)\nendin\n";
        let program = optimized(src);
        let body = &program.instruments[0].body;
        match &body[0].kind {
            StmtKind::Call { opcode, .. } => assert_eq!(opcode, "div"),
            other => panic!("expected div kept, got {other:?}"),
        }
    }

    #[test]
    fn optimizer_is_idempotent() {
        let src = "instr 1\nkx = 2 * 3 + 1\nif 0 then\nky = 9\nendif\nout oscil(kx, 440)\nendin\n";
        let program = optimized(src);
        let again = optimize(program.clone());
        assert_eq!(program, again);
    }

    #[test]
    fn noop_on_already_optimal_tree() {
        let src = "instr 1\nasig oscil 0.3, 440\nout asig\nendin\n";
        let program = optimized(src);
        let again = optimize(program.clone());
        assert_eq!(program, again);
    }
}
