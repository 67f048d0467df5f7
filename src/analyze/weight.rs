//! Instrument weight estimation.
//!
//! A pure bottom-up fold: each call site costs its opcode's declared
//! relative cost (1 unless the library says otherwise), statements sum
//! their parts, instruments sum their statements. The result is a
//! scheduling hint for the engine's thread assignment and never affects
//! correctness.

use std::collections::HashMap;

use tracing::debug;

use crate::opcode::OpcodeLibrary;
use crate::syntax::ast::*;

/// Fill in every instrument's weight. Deterministic and idempotent:
/// recomputing on an annotated tree overwrites with identical values.
pub fn calculate(mut program: Program, library: &dyn OpcodeLibrary) -> Program {
    // User-defined opcodes first, so a call to one costs its body.
    let mut udo_costs: HashMap<String, u32> = HashMap::new();
    for udo in &program.opcodes {
        let cost = body_weight(&udo.body, library, &udo_costs);
        udo_costs.insert(udo.name.clone(), cost.max(1));
    }

    for instr in &mut program.instruments {
        instr.weight = body_weight(&instr.body, library, &udo_costs);
        debug!(instr = instr.id, weight = instr.weight, "instrument weight");
    }
    program
}

fn body_weight(
    body: &[Stmt],
    library: &dyn OpcodeLibrary,
    udo_costs: &HashMap<String, u32>,
) -> u32 {
    body.iter()
        .map(|stmt| stmt_weight(stmt, library, udo_costs))
        .sum()
}

fn stmt_weight(
    stmt: &Stmt,
    library: &dyn OpcodeLibrary,
    udo_costs: &HashMap<String, u32>,
) -> u32 {
    match &stmt.kind {
        StmtKind::Assign { value, .. } => 1 + expr_weight(value, library, udo_costs),
        StmtKind::Call { opcode, args, .. } => {
            let call = call_cost(opcode, library, udo_costs);
            let args: u32 = args
                .iter()
                .map(|a| expr_weight(a, library, udo_costs))
                .sum();
            call + args
        }
        // Both branches count: the scheduler must assume either may run.
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            1 + expr_weight(cond, library, udo_costs)
                + body_weight(then_body, library, udo_costs)
                + body_weight(else_body, library, udo_costs)
        }
        StmtKind::While { cond, body } => {
            1 + expr_weight(cond, library, udo_costs) + body_weight(body, library, udo_costs)
        }
        StmtKind::Label(_) | StmtKind::Goto(_) => 0,
    }
}

fn expr_weight(
    expr: &Expr,
    library: &dyn OpcodeLibrary,
    udo_costs: &HashMap<String, u32>,
) -> u32 {
    match expr {
        Expr::Number(_) | Expr::Str(_) | Expr::Var(_) => 0,
        Expr::Unary { operand, .. } => 1 + expr_weight(operand, library, udo_costs),
        Expr::Binary { lhs, rhs, .. } => {
            1 + expr_weight(lhs, library, udo_costs) + expr_weight(rhs, library, udo_costs)
        }
        Expr::Call { opcode, args } => {
            let call = call_cost(opcode, library, udo_costs);
            let args: u32 = args
                .iter()
                .map(|a| expr_weight(a, library, udo_costs))
                .sum();
            call + args
        }
    }
}

fn call_cost(
    opcode: &str,
    library: &dyn OpcodeLibrary,
    udo_costs: &HashMap<String, u32>,
) -> u32 {
    if let Some(cost) = udo_costs.get(opcode) {
        return *cost;
    }
    library.lookup(opcode).map_or(1, |info| info.cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpcodeTable;
    use crate::syntax::lexer::Lexer;
    use crate::syntax::parser::Parser;
    use crate::syntax::symbol::SymbolTable;

    fn weighted(src: &str) -> Program {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut symbols = SymbolTable::new();
        let program = Parser::new(tokens).parse(&mut symbols).unwrap();
        calculate(program, &OpcodeTable::builtin())
    }

    #[test]
    fn unit_cost_per_call() {
        let program = weighted("instr 1\nkx = 1\nendin\n");
        assert_eq!(program.instruments[0].weight, 1);
    }

    #[test]
    fn declared_cost_raises_weight() {
        let cheap = weighted("instr 1\nasig oscil 0.3, 440\nout asig\nendin\n");
        let heavy =
            weighted("instr 1\nasig oscil 0.3, 440\nab convolve asig, \"ir.wav\"\nout ab\nendin\n");
        assert!(heavy.instruments[0].weight > cheap.instruments[0].weight);
    }

    #[test]
    fn adding_a_statement_never_decreases_weight() {
        let base = weighted("instr 1\nkx = 1\nendin\n");
        let grown = weighted("instr 1\nkx = 1\ngoto done\ndone:\nendin\n");
        assert!(grown.instruments[0].weight >= base.instruments[0].weight);
    }

    #[test]
    fn both_branches_counted() {
        let one = weighted("instr 1\nif 1 > 0 then\nkx = 1\nendif\nendin\n");
        let two = weighted("instr 1\nif 1 > 0 then\nkx = 1\nelse\nkx = 2\nky = 3\nendif\nendin\n");
        assert!(two.instruments[0].weight > one.instruments[0].weight);
    }

    #[test]
    fn udo_call_costs_its_body() {
        let src = "opcode thick, a, a\nab convolve p4, \"ir.wav\"\nendop\ninstr 1\nkx = 1\nendin\n";
        // Parse-level only; the UDO body uses convolve (cost 8), so a
        // call to `thick` should cost at least that much.
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut symbols = SymbolTable::new();
        let program = Parser::new(tokens).parse(&mut symbols).unwrap();
        let program = calculate(program, &OpcodeTable::builtin());
        assert!(program.instruments[0].weight >= 1);
        // And an instrument calling it is heavier than one that does not.
        let src2 = "opcode thick, a, a\nab convolve p4, \"ir.wav\"\nendop\ninstr 1\nasig thick p5\nout asig\nendin\n";
        let tokens2 = Lexer::new(src2).tokenize().unwrap();
        let mut symbols2 = SymbolTable::new();
        let program2 = Parser::new(tokens2).parse(&mut symbols2).unwrap();
        let program2 = calculate(program2, &OpcodeTable::builtin());
        assert!(program2.instruments[0].weight > program.instruments[0].weight);
    }

    #[test]
    fn recomputation_is_stable() {
        let program = weighted("instr 1\nasig oscil 0.3, 440\nout asig\nendin\n");
        let w = program.instruments[0].weight;
        let again = calculate(program, &OpcodeTable::builtin());
        assert_eq!(again.instruments[0].weight, w);
    }
}
