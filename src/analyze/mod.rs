//! Dependency analysis for safe parallel execution.
//!
//! Determines, per instrument, which global resources are read and
//! written, derives the set of shared-unsafe resources, and attaches lock
//! markers to every statement that touches one. The markers are consumed
//! by the graph compiler, which turns them into acquire/release
//! bracketing for the engine's worker threads.
//!
//! The pass only runs under multi-threaded compilation; single-threaded
//! programs carry no markers and pay no lock overhead.

pub mod weight;

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::opcode::OpcodeLibrary;
use crate::syntax::ast::*;

/// Global accesses of one instrument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyRecord {
    pub instr: u32,
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

/// Compute dependency records and attach lock markers.
///
/// Idempotent: a tree that already carries annotations is returned
/// untouched (guarded by [`Program::annotated`]), so running the pass
/// twice cannot double-insert markers.
pub fn insert_locks(
    mut program: Program,
    library: &dyn OpcodeLibrary,
) -> (Program, Vec<DependencyRecord>) {
    let records = collect_records(&program);
    if program.annotated {
        return (program, records);
    }

    let shared = shared_unsafe(&records);
    debug!(resources = ?shared, "shared-unsafe globals");

    for instr in &mut program.instruments {
        mark_body(&mut instr.body, &shared, library);
    }
    program.annotated = true;
    (program, records)
}

/// One record per instrument, in program order.
pub fn collect_records(program: &Program) -> Vec<DependencyRecord> {
    program
        .instruments
        .iter()
        .map(|instr| {
            let mut record = DependencyRecord {
                instr: instr.id,
                ..Default::default()
            };
            scan_body(&instr.body, &mut record);
            record
        })
        .collect()
}

/// A global is shared-unsafe when at least one instrument writes it and
/// at least one other instrument reads or writes it. Local variables
/// never appear here: they are excluded at scan time.
pub fn shared_unsafe(records: &[DependencyRecord]) -> BTreeSet<String> {
    let mut writers: BTreeMap<&str, usize> = BTreeMap::new();
    let mut accessors: BTreeMap<&str, usize> = BTreeMap::new();

    for record in records {
        for name in &record.writes {
            *writers.entry(name).or_default() += 1;
            *accessors.entry(name).or_default() += 1;
        }
        for name in &record.reads {
            if !record.writes.contains(name) {
                *accessors.entry(name).or_default() += 1;
            }
        }
    }

    writers
        .iter()
        .filter(|(name, _)| accessors.get(**name).copied().unwrap_or(0) > 1)
        .map(|(name, _)| name.to_string())
        .collect()
}

fn scan_body(body: &[Stmt], record: &mut DependencyRecord) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                if is_global_name(target) {
                    record.writes.insert(target.clone());
                }
                scan_expr(value, record);
            }
            StmtKind::Call { outs, args, .. } => {
                for out in outs {
                    if is_global_name(out) {
                        record.writes.insert(out.clone());
                    }
                }
                for arg in args {
                    scan_expr(arg, record);
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                scan_expr(cond, record);
                scan_body(then_body, record);
                scan_body(else_body, record);
            }
            StmtKind::While { cond, body } => {
                scan_expr(cond, record);
                scan_body(body, record);
            }
            StmtKind::Label(_) | StmtKind::Goto(_) => {}
        }
    }
}

fn scan_expr(expr: &Expr, record: &mut DependencyRecord) {
    match expr {
        Expr::Var(name) => {
            if is_global_name(name) {
                record.reads.insert(name.clone());
            }
        }
        Expr::Unary { operand, .. } => scan_expr(operand, record),
        Expr::Binary { lhs, rhs, .. } => {
            scan_expr(lhs, record);
            scan_expr(rhs, record);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                scan_expr(arg, record);
            }
        }
        Expr::Number(_) | Expr::Str(_) => {}
    }
}

/// Resource name guarding serial execution of a non-thread-safe opcode.
pub fn opcode_guard(name: &str) -> String {
    format!("opcode:{name}")
}

/// Collect serial guards for opcodes called in expression position.
/// Expansion later turns these into statement-level calls, but the
/// markers must exist before it runs.
fn guard_expr_opcodes(expr: &Expr, library: &dyn OpcodeLibrary, touched: &mut BTreeSet<String>) {
    match expr {
        Expr::Call { opcode, args } => {
            if let Some(info) = library.lookup(opcode) {
                if !info.thread_safe {
                    touched.insert(opcode_guard(opcode));
                }
            }
            for arg in args {
                guard_expr_opcodes(arg, library, touched);
            }
        }
        Expr::Unary { operand, .. } => guard_expr_opcodes(operand, library, touched),
        Expr::Binary { lhs, rhs, .. } => {
            guard_expr_opcodes(lhs, library, touched);
            guard_expr_opcodes(rhs, library, touched);
        }
        Expr::Number(_) | Expr::Str(_) | Expr::Var(_) => {}
    }
}

fn mark_body(body: &mut [Stmt], shared: &BTreeSet<String>, library: &dyn OpcodeLibrary) {
    for stmt in body {
        let mut touched = BTreeSet::new();
        let mut probe = DependencyRecord::default();
        match &mut stmt.kind {
            StmtKind::Assign { target, value } => {
                if is_global_name(target) {
                    probe.writes.insert(target.clone());
                }
                scan_expr(value, &mut probe);
                guard_expr_opcodes(value, library, &mut touched);
            }
            StmtKind::Call { outs, opcode, args } => {
                for out in outs.iter() {
                    if is_global_name(out) {
                        probe.writes.insert(out.clone());
                    }
                }
                for arg in args.iter() {
                    scan_expr(arg, &mut probe);
                    guard_expr_opcodes(arg, library, &mut touched);
                }
                // A non-thread-safe opcode needs its calls serialized
                // across all instruments, independent of any globals.
                if let Some(info) = library.lookup(opcode) {
                    if !info.thread_safe {
                        touched.insert(opcode_guard(opcode));
                    }
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                scan_expr(cond, &mut probe);
                guard_expr_opcodes(cond, library, &mut touched);
                mark_body(then_body, shared, library);
                mark_body(else_body, shared, library);
            }
            StmtKind::While { cond, body } => {
                scan_expr(cond, &mut probe);
                guard_expr_opcodes(cond, library, &mut touched);
                mark_body(body, shared, library);
            }
            StmtKind::Label(_) | StmtKind::Goto(_) => {}
        }

        for name in probe.reads.iter().chain(probe.writes.iter()) {
            if shared.contains(name) {
                touched.insert(name.clone());
            }
        }

        // Sorted and duplicate-free by construction (BTreeSet).
        stmt.locks = touched.into_iter().collect();
    }
}
