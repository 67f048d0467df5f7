//! End-to-end pipeline tests: source text in, instruction graph out.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use overture::graph::{Instruction, InstructionGraph, Slot};
use overture::{CompileConfig, Compiler, ErrorKind};

fn compile(src: &str, threads: usize) -> Result<InstructionGraph, overture::CompileError> {
    let compiler = Compiler::new(CompileConfig {
        num_threads: threads,
        debug: false,
    });
    compiler.compile(src).map(|out| out.graph)
}

fn call_order(graph: &InstructionGraph, instr: u32) -> Vec<String> {
    graph.instruments[&instr]
        .code
        .iter()
        .filter_map(|i| match i {
            Instruction::Call { opcode, .. } => Some(opcode.clone()),
            _ => None,
        })
        .collect()
}

fn acquired_locks(graph: &InstructionGraph, instr: u32) -> Vec<String> {
    graph.instruments[&instr]
        .code
        .iter()
        .filter_map(|i| match i {
            Instruction::Acquire(id) => Some(graph.locks[*id as usize].clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn writer_and_reader_both_locked() {
    let src = "\
instr 1
gkfreq = 440
endin
instr 2
asig oscil 0.3, gkfreq
out asig
endin
";
    let graph = compile(src, 4).unwrap();
    assert!(graph.locks.contains(&"gkfreq".to_string()));
    assert!(acquired_locks(&graph, 1).contains(&"gkfreq".to_string()));
    assert!(acquired_locks(&graph, 2).contains(&"gkfreq".to_string()));
}

#[test]
fn unmatched_conditional_aborts_before_parsing() {
    let src = "#ifdef DEBUG\ninstr 1\nkx = 1\nendin\n";
    let err = compile(src, 1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Preprocess);
    assert!(err.message.contains("unmatched"));
}

#[test]
fn three_syntax_errors_reported_with_count() {
    let src = "instr 1\nkx = \nky = * 2\n= 3\nendin\n";
    let err = compile(src, 1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Syntax { count: 3 });
}

#[test]
fn no_globals_means_no_lock_markers() {
    // Only thread-safe opcodes, no globals: nothing to serialize.
    let src = "\
instr 1
asig oscil 0.3, 440
amix convolve asig, \"ir.wav\"
endin
instr 2
ksweep line 0, 1, 2
aother oscil ksweep, 330
endin
";
    let graph = compile(src, 8).unwrap();
    assert!(graph.locks.is_empty());
    for code in graph.instruments.values() {
        assert!(code
            .code
            .iter()
            .all(|i| !matches!(i, Instruction::Acquire(_) | Instruction::Release(_))));
    }
}

#[test]
fn compound_expression_expands_to_elementary_calls() {
    let src = "\
instr 1
kstep = 2
kx = 1
kx = kx + kstep * 2
out oscil(kx, 440)
endin
";
    let graph = compile(src, 1).unwrap();
    let calls = call_order(&graph, 1);
    let mul = calls.iter().position(|c| c == "mul").expect("no mul emitted");
    let add = calls.iter().position(|c| c == "add").expect("no add emitted");
    assert!(mul < add, "product must be computed before the sum: {calls:?}");
}

#[test]
fn round_trip_thread_count_changes_only_locking() {
    let src = "\
instr 1
gkfreq = 440
endin
instr 2
asig oscil 0.3, gkfreq
out asig
endin
";
    let single = compile(src, 1).unwrap();
    let multi = compile(src, 4).unwrap();

    for id in [1u32, 2] {
        assert_eq!(
            call_order(&single, id),
            call_order(&multi, id),
            "call order differs for instrument {id}"
        );
        assert!(acquired_locks(&single, id).is_empty());
    }
    assert!(single.locks.is_empty());
    assert!(multi.locks.contains(&"gkfreq".to_string()));
}

#[test]
fn lock_acquisition_brackets_are_balanced() {
    let src = "\
instr 1
gka = 1
gkb = 2
endin
instr 2
kx = gka + gkb
out oscil(kx, 440)
endin
";
    let graph = compile(src, 4).unwrap();
    for code in graph.instruments.values() {
        let acquires = code
            .code
            .iter()
            .filter(|i| matches!(i, Instruction::Acquire(_)))
            .count();
        let releases = code
            .code
            .iter()
            .filter(|i| matches!(i, Instruction::Release(_)))
            .count();
        assert_eq!(acquires, releases, "unbalanced brackets in {:?}", code.code);
    }
}

#[test]
fn macros_and_conditionals_feed_the_compiler() {
    let src = "\
#define FREQ # 440 #
#define HALF(x) # $x / 2 #
#ifdef FREQ
instr 1
asig oscil 0.3, $HALF($FREQ)
out asig
endin
#else
instr 1
kbroken =
endin
#end
";
    let graph = compile(src, 1).unwrap();
    assert_eq!(graph.instruments.len(), 1);
    // 440 / 2 folds to a literal 220 argument
    let code = &graph.instruments[&1].code;
    let has_literal = code.iter().any(|i| match i {
        Instruction::Call { args, .. } => args
            .iter()
            .any(|s| matches!(s, overture::graph::Slot::Literal(v) if *v == 220.0)),
        _ => false,
    });
    assert!(has_literal, "folded oscillator frequency missing: {code:?}");
}

#[test]
fn exit_directive_truncates_the_orchestra() {
    let src = "\
instr 1
kx = 1
endin
#exit
instr 2
this is not even parseable
endin
";
    let graph = compile(src, 1).unwrap();
    assert_eq!(graph.instruments.len(), 1);
}

#[test]
fn weight_grows_with_body_size() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut body = String::from("asig oscil 0.3, 440\nout asig\n");
    let mut last = 0;
    for i in 0..12 {
        let src = format!("instr 1\n{body}endin\n");
        let graph = compile(&src, 2).unwrap();
        let weight = graph.instruments[&1].weight;
        assert!(
            weight >= last,
            "weight shrank from {last} to {weight} after adding a statement"
        );
        last = weight;
        let value: u32 = rng.gen_range(1..100);
        body.push_str(&format!("kv{i} = {value}\nout oscil(kv{i}, 440)\n"));
    }
}

#[test]
fn randomized_sharing_patterns_have_no_false_negatives() {
    let globals = ["gk0", "gk1", "gk2", "gk3"];
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);

    for round in 0..25 {
        let instr_count = rng.gen_range(2..=5);
        // access[i] = (reads, writes) over the global pool
        let mut access: Vec<(Vec<usize>, Vec<usize>)> = Vec::new();
        let mut src = String::new();
        for i in 0..instr_count {
            let mut reads = Vec::new();
            let mut writes = Vec::new();
            let id = i as u32 + 1;
            src.push_str(&format!("instr {id}\n"));
            for (g, name) in globals.iter().enumerate() {
                if rng.gen_bool(0.35) {
                    src.push_str(&format!("{name} = {}\n", rng.gen_range(1..10)));
                    writes.push(g);
                }
                if rng.gen_bool(0.35) {
                    src.push_str(&format!("kr{g} = {name}\nout oscil(kr{g}, 440)\n"));
                    reads.push(g);
                }
            }
            src.push_str("kidle = 0\nendin\n");
            access.push((reads, writes));
        }

        let graph = compile(&src, 4).unwrap();

        for (g, name) in globals.iter().enumerate() {
            let writers: Vec<usize> = (0..instr_count)
                .filter(|&i| access[i].1.contains(&g))
                .collect();
            let accessors: Vec<usize> = (0..instr_count)
                .filter(|&i| access[i].0.contains(&g) || access[i].1.contains(&g))
                .collect();
            if writers.is_empty() || accessors.len() < 2 {
                continue;
            }
            // Shared-unsafe: every accessing instrument must hold the lock.
            assert!(
                graph.locks.contains(&name.to_string()),
                "round {round}: `{name}` missing from lock table\n{src}"
            );
            for &i in &accessors {
                let held = acquired_locks(&graph, i as u32 + 1);
                assert!(
                    held.contains(&name.to_string()),
                    "round {round}: instrument {} accesses unsafe `{name}` without locking\n{src}",
                    i + 1
                );
            }
        }
    }
}

#[test]
fn while_condition_reread_stays_inside_lock_bracket() {
    // The loop condition reads a shared-unsafe global on every
    // iteration; each re-read must happen with the lock held.
    let src = "\
instr 1
gkx = 1
endin
instr 2
kn = 0
while gkx > 0 do
kn = kn + 1
od
out oscil(kn, 440)
endin
";
    let graph = compile(src, 4).unwrap();
    let lock = graph
        .locks
        .iter()
        .position(|l| l == "gkx")
        .expect("gkx missing from lock table") as u32;
    let code = &graph.instruments[&2].code;
    let mut held = 0i32;
    for (i, insn) in code.iter().enumerate() {
        match insn {
            Instruction::Acquire(id) if *id == lock => held += 1,
            Instruction::Release(id) if *id == lock => held -= 1,
            Instruction::Call { args, .. } => {
                if args.iter().any(|s| matches!(s, Slot::Global(_))) {
                    assert!(
                        held > 0,
                        "instruction {i} reads a shared global without the lock held:\n{code:?}"
                    );
                }
            }
            _ => {}
        }
    }
}

#[test]
fn expression_position_call_keeps_serial_guard() {
    let src = "\
instr 1
krnd = rand(1) + 0
out oscil(krnd, 440)
endin
instr 2
kr = rand(1)
out oscil(kr, 330)
endin
";
    let graph = compile(src, 4).unwrap();
    assert!(graph.locks.contains(&"opcode:rand".to_string()));
    for id in [1u32, 2] {
        assert!(
            acquired_locks(&graph, id).contains(&"opcode:rand".to_string()),
            "instrument {id} calls rand without its serial guard"
        );
    }
}

#[test]
fn control_flow_survives_the_whole_pipeline() {
    let src = "\
instr 1
kn = 0
while kn < 4 do
kn = kn + 1
od
if kn >= 4 then
asig oscil 0.3, 440
out asig
else
asig oscil 0.3, 220
out asig
endif
endin
";
    let graph = compile(src, 1).unwrap();
    let code = &graph.instruments[&1].code;
    let backward = code.iter().enumerate().any(|(i, insn)| match insn {
        Instruction::Jump(t) => *t < i,
        _ => false,
    });
    let conditional = code
        .iter()
        .any(|i| matches!(i, Instruction::JumpIfZero { .. }));
    assert!(backward, "loop lost its backward jump");
    assert!(conditional, "branch lost its conditional jump");
}

#[test]
fn named_instruments_compile_alongside_numbered() {
    let src = "\
instr pad
asig oscil 0.2, 330
out asig
endin
instr 5
asig oscil 0.3, 440
out asig
endin
";
    let graph = compile(src, 1).unwrap();
    assert_eq!(graph.instruments.len(), 2);
    let named = graph
        .instruments
        .values()
        .find(|c| c.name.as_deref() == Some("pad"))
        .expect("named instrument missing");
    assert_ne!(named.id, 5);
}

#[test]
fn semantic_error_aborts_with_location() {
    let src = "instr 1\nkx = Sname\nendin\n";
    let err = compile(src, 1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.line > 0);
}

#[test]
fn user_defined_opcode_calls_resolve() {
    let src = "\
opcode boost, a, a
ain xin
aout = ain * 2
xout aout
endop
instr 1
asig oscil 0.3, 440
aloud boost asig
out aloud
endin
";
    let graph = compile(src, 2).unwrap();
    let calls = call_order(&graph, 1);
    assert!(calls.contains(&"boost".to_string()), "calls: {calls:?}");
    assert!(graph.instruments[&1].weight >= 1);
}
