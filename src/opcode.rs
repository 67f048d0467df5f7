//! Opcode library interface.
//!
//! The compiler never executes an opcode; it only needs each opcode's
//! accepted signatures, a thread-safety flag, and a relative cost used by
//! the weight pass. The DSP implementations live outside this crate.

use std::collections::HashMap;

use crate::syntax::ast::Rate;

/// One accepted parameter/return shape for an opcode.
///
/// Opcodes may be overloaded by arity and by rate class; `Param::Any`
/// accepts every rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub outs: Vec<Param>,
    pub ins: Vec<Param>,
}

/// A single parameter slot in a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Rate(Rate),
    /// Accepts any rate class.
    Any,
}

impl Param {
    pub fn accepts(&self, rate: Rate) -> bool {
        match self {
            Param::Any => true,
            // A control slot also accepts init-rate values (a constant or
            // init-time scalar can always feed a control input).
            Param::Rate(Rate::Control) => matches!(rate, Rate::Control | Rate::Init),
            Param::Rate(want) => *want == rate,
        }
    }
}

/// Everything the compiler knows about one opcode.
#[derive(Debug, Clone)]
pub struct OpcodeInfo {
    pub name: String,
    pub signatures: Vec<Signature>,
    /// Whether concurrent calls from different instruments are safe.
    pub thread_safe: bool,
    /// Relative execution cost, 1 for ordinary opcodes.
    pub cost: u32,
}

/// The collaborator interface the compiler queries during verification and
/// graph compilation.
pub trait OpcodeLibrary {
    fn lookup(&self, name: &str) -> Option<&OpcodeInfo>;
}

/// In-memory opcode table, seeded with the elementary and demonstration
/// opcodes the test suite and the expander rely on.
#[derive(Debug, Default)]
pub struct OpcodeTable {
    entries: HashMap<String, OpcodeInfo>,
}

impl OpcodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: OpcodeInfo) {
        self.entries.insert(info.name.clone(), info);
    }

    /// The built-in table: elementary arithmetic (targets of expression
    /// expansion) plus a representative set of generator/output opcodes.
    pub fn builtin() -> Self {
        let mut table = Self::new();

        // Elementary ops emitted by the expression expander. One output,
        // rate-polymorphic.
        for name in ["add", "sub", "mul", "div", "pow", "mod"] {
            table.insert(OpcodeInfo {
                name: name.to_string(),
                signatures: vec![Signature {
                    outs: vec![Param::Any],
                    ins: vec![Param::Any, Param::Any],
                }],
                thread_safe: true,
                cost: 1,
            });
        }
        for name in ["neg", "assign"] {
            table.insert(OpcodeInfo {
                name: name.to_string(),
                signatures: vec![Signature {
                    outs: vec![Param::Any],
                    ins: vec![Param::Any],
                }],
                thread_safe: true,
                cost: 1,
            });
        }
        for name in ["eq", "ne", "lt", "le", "gt", "ge"] {
            table.insert(OpcodeInfo {
                name: name.to_string(),
                signatures: vec![Signature {
                    outs: vec![Param::Rate(Rate::Control)],
                    ins: vec![Param::Any, Param::Any],
                }],
                thread_safe: true,
                cost: 1,
            });
        }

        // User-defined opcode bodies bind their parameters with xin and
        // hand results back with xout. Overloaded by arity up to four.
        table.insert(OpcodeInfo {
            name: "xin".to_string(),
            signatures: (1..=4)
                .map(|n| Signature {
                    outs: vec![Param::Any; n],
                    ins: vec![],
                })
                .collect(),
            thread_safe: true,
            cost: 1,
        });
        table.insert(OpcodeInfo {
            name: "xout".to_string(),
            signatures: (1..=4)
                .map(|n| Signature {
                    outs: vec![],
                    ins: vec![Param::Any; n],
                })
                .collect(),
            thread_safe: true,
            cost: 1,
        });

        table.insert(OpcodeInfo {
            name: "oscil".to_string(),
            signatures: vec![
                Signature {
                    outs: vec![Param::Rate(Rate::Audio)],
                    ins: vec![Param::Rate(Rate::Control), Param::Rate(Rate::Control)],
                },
                Signature {
                    outs: vec![Param::Rate(Rate::Audio)],
                    ins: vec![
                        Param::Rate(Rate::Control),
                        Param::Rate(Rate::Control),
                        Param::Rate(Rate::Init),
                    ],
                },
            ],
            thread_safe: true,
            cost: 2,
        });
        table.insert(OpcodeInfo {
            name: "line".to_string(),
            signatures: vec![Signature {
                outs: vec![Param::Rate(Rate::Control)],
                ins: vec![
                    Param::Rate(Rate::Init),
                    Param::Rate(Rate::Init),
                    Param::Rate(Rate::Init),
                ],
            }],
            thread_safe: true,
            cost: 1,
        });
        table.insert(OpcodeInfo {
            name: "out".to_string(),
            signatures: vec![Signature {
                outs: vec![],
                ins: vec![Param::Rate(Rate::Audio)],
            }],
            thread_safe: false,
            cost: 1,
        });
        table.insert(OpcodeInfo {
            name: "outs".to_string(),
            signatures: vec![Signature {
                outs: vec![],
                ins: vec![Param::Rate(Rate::Audio), Param::Rate(Rate::Audio)],
            }],
            thread_safe: false,
            cost: 1,
        });
        table.insert(OpcodeInfo {
            name: "rand".to_string(),
            signatures: vec![Signature {
                outs: vec![Param::Any],
                ins: vec![Param::Rate(Rate::Control)],
            }],
            thread_safe: false,
            cost: 1,
        });
        table.insert(OpcodeInfo {
            name: "print".to_string(),
            signatures: vec![Signature {
                outs: vec![],
                ins: vec![Param::Any],
            }],
            thread_safe: false,
            cost: 1,
        });
        // Spectral opcodes carry a declared higher cost.
        table.insert(OpcodeInfo {
            name: "convolve".to_string(),
            signatures: vec![Signature {
                outs: vec![Param::Rate(Rate::Audio)],
                ins: vec![Param::Rate(Rate::Audio), Param::Rate(Rate::Str)],
            }],
            thread_safe: true,
            cost: 8,
        });
        table.insert(OpcodeInfo {
            name: "spectrum".to_string(),
            signatures: vec![Signature {
                outs: vec![Param::Rate(Rate::Audio)],
                ins: vec![Param::Rate(Rate::Audio), Param::Rate(Rate::Init)],
            }],
            thread_safe: true,
            cost: 5,
        });

        table
    }
}

impl OpcodeLibrary for OpcodeTable {
    fn lookup(&self, name: &str) -> Option<&OpcodeInfo> {
        self.entries.get(name)
    }
}
