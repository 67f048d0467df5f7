//! Macro definitions for the preprocessor.

use indexmap::IndexMap;

/// One `#define` entry. Parameterless macros have an empty param list.
#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    pub params: Vec<String>,
    pub body: String,
}

/// Name to definition map. Redefinition silently replaces, matching the
/// usual preprocessor contract.
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    entries: IndexMap<String, Macro>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-seeded with the standard math constants, so orchestra
    /// code can write `$M_PI` without defining anything.
    pub fn with_builtins() -> Self {
        use std::f64::consts;
        let mut table = Self::new();
        let constants: [(&str, f64); 13] = [
            ("M_E", consts::E),
            ("M_LOG2E", consts::LOG2_E),
            ("M_LOG10E", consts::LOG10_E),
            ("M_LN2", consts::LN_2),
            ("M_LN10", consts::LN_10),
            ("M_PI", consts::PI),
            ("M_PI_2", consts::FRAC_PI_2),
            ("M_PI_4", consts::FRAC_PI_4),
            ("M_1_PI", consts::FRAC_1_PI),
            ("M_2_PI", consts::FRAC_2_PI),
            ("M_2_SQRTPI", consts::FRAC_2_SQRT_PI),
            ("M_SQRT2", consts::SQRT_2),
            ("M_SQRT1_2", consts::FRAC_1_SQRT_2),
        ];
        for (name, value) in constants {
            table.define(name, Vec::new(), format!("{value}"));
        }
        table
    }

    pub fn define(&mut self, name: &str, params: Vec<String>, body: String) {
        self.entries.insert(name.to_string(), Macro { params, body });
    }

    pub fn undef(&mut self, name: &str) -> bool {
        self.entries.shift_remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.entries.get(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
