//! Verifier: semantic checks over the parsed tree.
//!
//! Walks the AST against the symbol table, confirming that every variable
//! reference resolves, every opcode call matches one of the opcode's
//! declared signatures, and control-flow labels resolve within their
//! body. Declares instrument locals and interns globals along the way.
//!
//! Sugared forms are already in canonical node shape when they reach this
//! stage (the parser rewrites compound assignment at the sugar site); the
//! verifier relies on that invariant rather than re-normalizing.

use std::collections::HashSet;

use crate::error::CompileError;
use crate::opcode::{OpcodeLibrary, Param, Signature};
use crate::syntax::ast::*;
use crate::syntax::symbol::SymbolTable;

/// Scope ids for user-defined opcode bodies sit above this base so they
/// never collide with instrument numbers.
pub const UDO_SCOPE_BASE: u32 = 0x8000_0000;

/// Verify `program`, populating local and global symbol entries.
///
/// Takes ownership of the tree and returns it unchanged on success;
/// failure is fatal and reported with the offending source line.
pub fn verify(
    program: Program,
    symbols: &mut SymbolTable,
    library: &dyn OpcodeLibrary,
) -> Result<Program, CompileError> {
    let udo_sigs: Vec<(String, Vec<Rate>, Vec<Rate>)> = program
        .opcodes
        .iter()
        .map(|udo| (udo.name.clone(), udo.out_rates.clone(), udo.in_rates.clone()))
        .collect();

    let ctx = Context {
        library,
        udos: &udo_sigs,
    };

    for instr in &program.instruments {
        collect_decls(&instr.body, instr.id, symbols)?;
        let labels = collect_labels(&instr.body);
        check_body(&instr.body, instr.id, symbols, &ctx, &labels)?;
    }
    for (i, udo) in program.opcodes.iter().enumerate() {
        let scope = UDO_SCOPE_BASE + i as u32;
        symbols.ensure_scope(scope);
        collect_decls(&udo.body, scope, symbols)?;
        let labels = collect_labels(&udo.body);
        check_body(&udo.body, scope, symbols, &ctx, &labels)?;
    }

    Ok(program)
}

struct Context<'a> {
    library: &'a dyn OpcodeLibrary,
    udos: &'a [(String, Vec<Rate>, Vec<Rate>)],
}

/// First pass: every assignment target and call result declares a
/// variable in its scope (or interns a global).
fn collect_decls(
    body: &[Stmt],
    scope: u32,
    symbols: &mut SymbolTable,
) -> Result<(), CompileError> {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { target, .. } => {
                declare(target, scope, symbols, stmt.line)?;
            }
            StmtKind::Call { outs, .. } => {
                for out in outs {
                    declare(out, scope, symbols, stmt.line)?;
                }
            }
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                collect_decls(then_body, scope, symbols)?;
                collect_decls(else_body, scope, symbols)?;
            }
            StmtKind::While { body, .. } => collect_decls(body, scope, symbols)?,
            StmtKind::Label(_) | StmtKind::Goto(_) => {}
        }
    }
    Ok(())
}

fn declare(
    name: &str,
    scope: u32,
    symbols: &mut SymbolTable,
    line: usize,
) -> Result<(), CompileError> {
    if is_pfield(name) {
        return Err(CompileError::semantic(
            format!("cannot write to parameter field '{name}'"),
            line,
        ));
    }
    let rate = rate_of(name, line)?;
    if is_global_name(name) {
        symbols.intern_global(name, rate);
    } else {
        symbols.declare_local(scope, name, rate);
    }
    Ok(())
}

fn rate_of(name: &str, line: usize) -> Result<Rate, CompileError> {
    Rate::of_name(name).ok_or_else(|| {
        CompileError::semantic(
            format!("cannot infer rate class of '{name}' (no a/k/i/S prefix)"),
            line,
        )
    })
}

fn collect_labels(body: &[Stmt]) -> HashSet<String> {
    let mut labels = HashSet::new();
    fn walk(body: &[Stmt], labels: &mut HashSet<String>) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Label(name) => {
                    labels.insert(name.clone());
                }
                StmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    walk(then_body, labels);
                    walk(else_body, labels);
                }
                StmtKind::While { body, .. } => walk(body, labels),
                _ => {}
            }
        }
    }
    walk(body, &mut labels);
    labels
}

fn check_body(
    body: &[Stmt],
    scope: u32,
    symbols: &mut SymbolTable,
    ctx: &Context,
    labels: &HashSet<String>,
) -> Result<(), CompileError> {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                let value_rate = check_expr(value, scope, symbols, ctx, stmt.line)?;
                let target_rate = rate_of(target, stmt.line)?;
                check_assignable(target, target_rate, value_rate, stmt.line)?;
            }
            StmtKind::Call { outs, opcode, args } => {
                check_call(outs, opcode, args, scope, symbols, ctx, stmt.line)?;
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let rate = check_expr(cond, scope, symbols, ctx, stmt.line)?;
                if rate == Rate::Str {
                    return Err(CompileError::semantic(
                        "condition cannot be a string",
                        stmt.line,
                    ));
                }
                check_body(then_body, scope, symbols, ctx, labels)?;
                check_body(else_body, scope, symbols, ctx, labels)?;
            }
            StmtKind::While { cond, body } => {
                let rate = check_expr(cond, scope, symbols, ctx, stmt.line)?;
                if rate == Rate::Str {
                    return Err(CompileError::semantic(
                        "condition cannot be a string",
                        stmt.line,
                    ));
                }
                check_body(body, scope, symbols, ctx, labels)?;
            }
            StmtKind::Label(_) => {}
            StmtKind::Goto(label) => {
                if !labels.contains(label) {
                    return Err(CompileError::semantic(
                        format!("goto target '{label}' is not defined"),
                        stmt.line,
                    ));
                }
            }
        }
    }
    Ok(())
}

fn check_assignable(
    target: &str,
    target_rate: Rate,
    value_rate: Rate,
    line: usize,
) -> Result<(), CompileError> {
    let ok = match target_rate {
        Rate::Audio => value_rate != Rate::Str,
        Rate::Control => matches!(value_rate, Rate::Control | Rate::Init),
        Rate::Init => value_rate == Rate::Init,
        Rate::Str => value_rate == Rate::Str,
    };
    if ok {
        Ok(())
    } else {
        Err(CompileError::semantic(
            format!("cannot assign a {value_rate:?}-rate value to '{target}'"),
            line,
        ))
    }
}

/// Verify a variable reference and return its rate class.
fn check_var(
    name: &str,
    scope: u32,
    symbols: &mut SymbolTable,
    line: usize,
) -> Result<Rate, CompileError> {
    if is_pfield(name) {
        return Ok(Rate::Init);
    }
    let rate = rate_of(name, line)?;
    if is_global_name(name) {
        // A global read is a resolution in itself: global storage is
        // zero-initialized, so reading one that no instrument writes is
        // legal. Intern it so it owns a storage slot.
        symbols.intern_global(name, rate);
        return Ok(rate);
    }
    if symbols.local(scope, name).is_none() {
        return Err(CompileError::semantic(
            format!("'{name}' is never assigned in this scope"),
            line,
        ));
    }
    Ok(rate)
}

fn check_expr(
    expr: &Expr,
    scope: u32,
    symbols: &mut SymbolTable,
    ctx: &Context,
    line: usize,
) -> Result<Rate, CompileError> {
    match expr {
        Expr::Number(_) => Ok(Rate::Init),
        Expr::Str(_) => Ok(Rate::Str),
        Expr::Var(name) => check_var(name, scope, symbols, line),
        Expr::Unary { operand, .. } => {
            let rate = check_expr(operand, scope, symbols, ctx, line)?;
            if rate == Rate::Str {
                return Err(CompileError::semantic(
                    "cannot negate a string",
                    line,
                ));
            }
            Ok(rate)
        }
        Expr::Binary { op, lhs, rhs } => {
            let lr = check_expr(lhs, scope, symbols, ctx, line)?;
            let rr = check_expr(rhs, scope, symbols, ctx, line)?;
            if lr == Rate::Str || rr == Rate::Str {
                return Err(CompileError::semantic(
                    format!("operator '{}' cannot take a string operand", op.opcode()),
                    line,
                ));
            }
            if is_comparison(*op) {
                Ok(Rate::Control)
            } else {
                Ok(max_rate(lr, rr))
            }
        }
        Expr::Call { opcode, args } => {
            let mut arg_rates = Vec::with_capacity(args.len());
            for arg in args {
                arg_rates.push(check_expr(arg, scope, symbols, ctx, line)?);
            }
            resolve_call(opcode, None, &arg_rates, ctx, line)
        }
    }
}

fn check_call(
    outs: &[String],
    opcode: &str,
    args: &[Expr],
    scope: u32,
    symbols: &mut SymbolTable,
    ctx: &Context,
    line: usize,
) -> Result<(), CompileError> {
    let mut arg_rates = Vec::with_capacity(args.len());
    for arg in args {
        arg_rates.push(check_expr(arg, scope, symbols, ctx, line)?);
    }
    let out_rates: Vec<Rate> = outs
        .iter()
        .map(|o| rate_of(o, line))
        .collect::<Result<_, _>>()?;
    resolve_call_outs(opcode, &out_rates, &arg_rates, ctx, line)?;
    Ok(())
}

fn is_comparison(op: BinOp) -> bool {
    matches!(
        op,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
    )
}

/// Audio > Control > Init for result-rate purposes.
pub fn max_rate(a: Rate, b: Rate) -> Rate {
    fn rank(r: Rate) -> u8 {
        match r {
            Rate::Init => 0,
            Rate::Control => 1,
            Rate::Audio => 2,
            Rate::Str => 3,
        }
    }
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

fn sig_matches(sig: &Signature, out_rates: Option<&[Rate]>, arg_rates: &[Rate]) -> bool {
    if sig.ins.len() != arg_rates.len() {
        return false;
    }
    if let Some(outs) = out_rates {
        if sig.outs.len() != outs.len() {
            return false;
        }
        for (param, rate) in sig.outs.iter().zip(outs) {
            match param {
                Param::Any => {}
                Param::Rate(want) if want == rate => {}
                _ => return false,
            }
        }
    } else if sig.outs.len() != 1 {
        // Expression position implies exactly one result.
        return false;
    }
    sig.ins
        .iter()
        .zip(arg_rates)
        .all(|(param, rate)| param.accepts(*rate))
}

/// Resolve an expression-position call and return its result rate.
fn resolve_call(
    opcode: &str,
    out_rates: Option<&[Rate]>,
    arg_rates: &[Rate],
    ctx: &Context,
    line: usize,
) -> Result<Rate, CompileError> {
    if let Some((_, udo_outs, udo_ins)) = ctx.udos.iter().find(|(n, _, _)| n == opcode) {
        let sig = Signature {
            outs: udo_outs.iter().map(|r| Param::Rate(*r)).collect(),
            ins: udo_ins.iter().map(|r| Param::Rate(*r)).collect(),
        };
        if !sig_matches(&sig, out_rates, arg_rates) {
            return Err(CompileError::semantic(
                format!("no matching form of opcode '{opcode}' for these arguments"),
                line,
            ));
        }
        return Ok(udo_outs.first().copied().unwrap_or(Rate::Init));
    }

    let info = ctx.library.lookup(opcode).ok_or_else(|| {
        CompileError::semantic(format!("unknown opcode '{opcode}'"), line)
    })?;
    for sig in &info.signatures {
        if sig_matches(sig, out_rates, arg_rates) {
            let result = match sig.outs.first() {
                Some(Param::Rate(r)) => *r,
                Some(Param::Any) => arg_rates
                    .iter()
                    .copied()
                    .fold(Rate::Init, max_rate),
                None => Rate::Init,
            };
            return Ok(result);
        }
    }
    if info.signatures.iter().any(|s| s.ins.len() == arg_rates.len()) {
        Err(CompileError::semantic(
            format!("argument types do not match any form of '{opcode}'"),
            line,
        ))
    } else {
        Err(CompileError::semantic(
            format!(
                "wrong number of arguments to '{opcode}' (got {})",
                arg_rates.len()
            ),
            line,
        ))
    }
}

fn resolve_call_outs(
    opcode: &str,
    out_rates: &[Rate],
    arg_rates: &[Rate],
    ctx: &Context,
    line: usize,
) -> Result<(), CompileError> {
    resolve_call(opcode, Some(out_rates), arg_rates, ctx, line).map(|_| ())
}
