//! Instruction graph emission.
//!
//! The final stage lowers the expanded, optimized tree into a flat
//! per-instrument instruction list the engine can execute without
//! consulting the AST. Structured control flow becomes jumps, variable
//! names become dense storage slots, and lock markers become explicit
//! acquire/release bracketing around the statements that need them.
//!
//! Everything arriving here has already been verified and expanded, so a
//! malformed input (an unexpanded expression, a goto to a label the
//! verifier somehow missed) is a compiler fault and reported as
//! [`ErrorKind::Internal`].

use indexmap::IndexMap;
use tracing::debug;

use crate::error::CompileError;
use crate::syntax::ast::*;
use crate::syntax::symbol::SymbolTable;

/// Storage reference of one operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    /// Index into program-wide global storage.
    Global(u32),
    /// Index into the owning instrument's local frame.
    Local(u32),
    /// Inline numeric constant.
    Literal(f64),
    /// Index into the graph's string table.
    Str(u32),
    /// Parameter field of the triggering event, 1-based.
    PField(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Call {
        opcode: String,
        outs: Vec<Slot>,
        args: Vec<Slot>,
    },
    /// Take the named lock (index into [`InstructionGraph::locks`]).
    Acquire(u32),
    Release(u32),
    Jump(usize),
    JumpIfZero { cond: Slot, target: usize },
}

/// Flat code for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentCode {
    pub id: u32,
    pub name: Option<String>,
    /// Scheduling weight carried over from the analyzer.
    pub weight: u32,
    /// Size of the local frame, temporaries included.
    pub local_count: u32,
    pub code: Vec<Instruction>,
}

/// The compiled orchestra: per-instrument code plus the shared tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionGraph {
    pub instruments: IndexMap<u32, InstrumentCode>,
    /// Lock names, indexed by the ids in acquire/release instructions.
    pub locks: Vec<String>,
    /// Interned string literals.
    pub strings: Vec<String>,
    pub global_count: u32,
}

impl InstructionGraph {
    /// Human-readable listing, one instruction per line.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for code in self.instruments.values() {
            let _ = match &code.name {
                Some(name) => writeln!(out, "instr {} ({name}) weight={}", code.id, code.weight),
                None => writeln!(out, "instr {} weight={}", code.id, code.weight),
            };
            for (i, insn) in code.code.iter().enumerate() {
                let _ = match insn {
                    Instruction::Call { opcode, outs, args } => {
                        writeln!(out, "  {i:4}  {opcode} {outs:?} <- {args:?}")
                    }
                    Instruction::Acquire(id) => {
                        writeln!(out, "  {i:4}  acquire {}", self.locks[*id as usize])
                    }
                    Instruction::Release(id) => {
                        writeln!(out, "  {i:4}  release {}", self.locks[*id as usize])
                    }
                    Instruction::Jump(t) => writeln!(out, "  {i:4}  jump {t}"),
                    Instruction::JumpIfZero { cond, target } => {
                        writeln!(out, "  {i:4}  jz {cond:?} {target}")
                    }
                };
            }
        }
        out
    }
}

/// Lower every instrument to flat code.
///
/// User-defined opcode bodies are not lowered here; their calls remain
/// symbolic in the instruction stream and the engine binds them at load
/// time.
pub fn compile(
    program: &Program,
    symbols: &SymbolTable,
) -> Result<InstructionGraph, CompileError> {
    let mut locks: IndexMap<String, ()> = IndexMap::new();
    let mut strings: IndexMap<String, ()> = IndexMap::new();
    let mut instruments = IndexMap::new();

    for instr in &program.instruments {
        let mut emitter = Emitter {
            symbols,
            locks: &mut locks,
            strings: &mut strings,
            slots: IndexMap::new(),
            code: Vec::new(),
            labels: IndexMap::new(),
            fixups: Vec::new(),
            open: Vec::new(),
        };
        emitter.emit_body(&instr.body)?;
        emitter.close_locks();
        emitter.patch_jumps(instr.id)?;

        debug!(
            instr = instr.id,
            instructions = emitter.code.len(),
            locals = emitter.slots.len(),
            "lowered instrument"
        );
        instruments.insert(
            instr.id,
            InstrumentCode {
                id: instr.id,
                name: instr.name.clone(),
                weight: instr.weight,
                local_count: emitter.slots.len() as u32,
                code: emitter.code,
            },
        );
    }

    Ok(InstructionGraph {
        instruments,
        locks: locks.into_keys().collect(),
        strings: strings.into_keys().collect(),
        global_count: symbols.global_count() as u32,
    })
}

struct Emitter<'a> {
    symbols: &'a SymbolTable,
    locks: &'a mut IndexMap<String, ()>,
    strings: &'a mut IndexMap<String, ()>,
    /// Dense local frame, first-use order. Includes compiler temporaries,
    /// which never reach the symbol table.
    slots: IndexMap<String, u32>,
    code: Vec<Instruction>,
    labels: IndexMap<String, usize>,
    fixups: Vec<(usize, String, usize)>,
    /// Lock bracket currently held, used to coalesce adjacent statements
    /// that guard the same resources into one bracket.
    open: Vec<String>,
}

impl Emitter<'_> {
    fn emit_body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Call { outs, opcode, args } => {
                    let outs = outs
                        .iter()
                        .map(|o| self.slot_of_name(o, stmt.line))
                        .collect::<Result<Vec<_>, _>>()?;
                    let args = args
                        .iter()
                        .map(|a| self.slot_of_expr(a, stmt.line))
                        .collect::<Result<Vec<_>, _>>()?;
                    self.sync_locks(&stmt.locks);
                    self.code.push(Instruction::Call {
                        opcode: opcode.clone(),
                        outs,
                        args,
                    });
                }
                StmtKind::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    let cond = self.slot_of_expr(cond, stmt.line)?;
                    // The test itself may read a guarded global; both exit
                    // paths of the branch must drop the bracket.
                    self.sync_locks(&stmt.locks);
                    let held = std::mem::take(&mut self.open);
                    let jz = self.code.len();
                    self.code.push(Instruction::JumpIfZero { cond, target: 0 });
                    self.emit_releases(&held);
                    self.emit_body(then_body)?;
                    self.close_locks();
                    let jend = self.code.len();
                    self.code.push(Instruction::Jump(0));
                    let else_at = self.code.len();
                    self.set_target(jz, else_at);
                    self.emit_releases(&held);
                    self.emit_body(else_body)?;
                    self.close_locks();
                    let end = self.code.len();
                    self.set_target(jend, end);
                }
                StmtKind::While { cond, body } => {
                    self.close_locks();
                    let top = self.code.len();
                    let cond = self.slot_of_expr(cond, stmt.line)?;
                    self.sync_locks(&stmt.locks);
                    let held = std::mem::take(&mut self.open);
                    let jz = self.code.len();
                    self.code.push(Instruction::JumpIfZero { cond, target: 0 });
                    self.emit_releases(&held);
                    self.emit_body(body)?;
                    self.close_locks();
                    self.code.push(Instruction::Jump(top));
                    let end = self.code.len();
                    self.set_target(jz, end);
                    self.emit_releases(&held);
                }
                StmtKind::Label(name) => {
                    self.close_locks();
                    self.labels.insert(name.clone(), self.code.len());
                }
                StmtKind::Goto(name) => {
                    self.close_locks();
                    self.fixups.push((self.code.len(), name.clone(), stmt.line));
                    self.code.push(Instruction::Jump(usize::MAX));
                }
                StmtKind::Assign { .. } => {
                    return Err(CompileError::internal(
                        "assignment survived expression expansion",
                        stmt.line,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Bring the held lock bracket in line with `target`. Identical
    /// brackets on adjacent statements are kept open rather than
    /// released and immediately re-acquired.
    fn sync_locks(&mut self, target: &[String]) {
        if self.open == target {
            return;
        }
        let held = std::mem::take(&mut self.open);
        self.emit_releases(&held);
        for name in target {
            let id = self.lock_id(name);
            self.code.push(Instruction::Acquire(id));
        }
        self.open = target.to_vec();
    }

    fn close_locks(&mut self) {
        self.sync_locks(&[]);
    }

    fn emit_releases(&mut self, held: &[String]) {
        for name in held.iter().rev() {
            let id = self.lock_id(name);
            self.code.push(Instruction::Release(id));
        }
    }

    fn lock_id(&mut self, name: &str) -> u32 {
        let (index, _) = self.locks.insert_full(name.to_string(), ());
        index as u32
    }

    fn set_target(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Instruction::Jump(t) => *t = target,
            Instruction::JumpIfZero { target: t, .. } => *t = target,
            _ => {}
        }
    }

    fn patch_jumps(&mut self, instr: u32) -> Result<(), CompileError> {
        for (at, label, line) in std::mem::take(&mut self.fixups) {
            match self.labels.get(&label) {
                Some(&target) => self.set_target(at, target),
                None => {
                    return Err(CompileError::internal(
                        format!("unresolved label `{label}` in instrument {instr}"),
                        line,
                    ));
                }
            }
        }
        Ok(())
    }

    fn slot_of_expr(&mut self, expr: &Expr, line: usize) -> Result<Slot, CompileError> {
        match expr {
            Expr::Number(n) => Ok(Slot::Literal(*n)),
            Expr::Str(s) => {
                let (index, _) = self.strings.insert_full(s.clone(), ());
                Ok(Slot::Str(index as u32))
            }
            Expr::Var(name) => self.slot_of_name(name, line),
            _ => Err(CompileError::internal(
                "non-atomic expression survived expansion",
                line,
            )),
        }
    }

    fn slot_of_name(&mut self, name: &str, line: usize) -> Result<Slot, CompileError> {
        if is_pfield(name) {
            let n: u16 = name[1..].parse().map_err(|_| {
                CompileError::internal(format!("bad parameter field `{name}`"), line)
            })?;
            return Ok(Slot::PField(n));
        }
        if is_global_name(name) {
            return match self.symbols.global(name) {
                Some((_, id)) => Ok(Slot::Global(id.0)),
                None => Err(CompileError::internal(
                    format!("global `{name}` missing from symbol table"),
                    line,
                )),
            };
        }
        let next = self.slots.len() as u32;
        let slot = *self.slots.entry(name.to_string()).or_insert(next);
        Ok(Slot::Local(slot))
    }
}
