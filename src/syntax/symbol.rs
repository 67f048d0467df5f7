//! Symbol table: globals, instruments, user-defined opcodes, and
//! per-instrument locals.
//!
//! Entries are created during parsing and verification, then consulted
//! (never mutated in place) by the later stages. Insertion order is
//! preserved so global slot ids are deterministic.

use indexmap::IndexMap;

use super::ast::Rate;

/// Dense id of a global variable, also its storage slot in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalId(pub u32);

/// A declared variable, global or instrument-local.
#[derive(Debug, Clone, PartialEq)]
pub struct VarSym {
    pub name: String,
    pub rate: Rate,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    globals: IndexMap<String, VarSym>,
    /// Instrument id -> optional name; ids are unique across the program.
    instruments: IndexMap<u32, Option<String>>,
    /// Named-instrument lookup.
    instr_names: IndexMap<String, u32>,
    /// Per-instrument locals, keyed by instrument id.
    locals: IndexMap<u32, IndexMap<String, VarSym>>,
    /// User-defined opcode names (bodies live in the AST).
    udos: IndexMap<String, ()>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a global on first sight; repeated sightings are fine as
    /// long as the rate class agrees (checked by the verifier).
    pub fn intern_global(&mut self, name: &str, rate: Rate) -> GlobalId {
        let index = match self.globals.get_index_of(name) {
            Some(i) => i,
            None => {
                self.globals.insert(
                    name.to_string(),
                    VarSym {
                        name: name.to_string(),
                        rate,
                    },
                );
                self.globals.len() - 1
            }
        };
        GlobalId(index as u32)
    }

    pub fn global(&self, name: &str) -> Option<(&VarSym, GlobalId)> {
        self.globals
            .get_full(name)
            .map(|(i, _, sym)| (sym, GlobalId(i as u32)))
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    pub fn globals(&self) -> impl Iterator<Item = (&String, &VarSym)> {
        self.globals.iter()
    }

    /// Register an instrument id. Returns false if the id is taken.
    pub fn add_instrument(&mut self, id: u32, name: Option<&str>) -> bool {
        if self.instruments.contains_key(&id) {
            return false;
        }
        if let Some(n) = name {
            if self.instr_names.contains_key(n) {
                return false;
            }
            self.instr_names.insert(n.to_string(), id);
        }
        self.instruments.insert(id, name.map(str::to_string));
        self.locals.insert(id, IndexMap::new());
        true
    }

    /// Smallest positive id not yet taken, for named instruments.
    pub fn next_free_instrument_id(&self) -> u32 {
        let mut id = 1;
        while self.instruments.contains_key(&id) {
            id += 1;
        }
        id
    }

    /// Create an empty local scope that is not an instrument (used for
    /// user-defined opcode bodies, which get synthetic scope ids).
    pub fn ensure_scope(&mut self, id: u32) {
        self.locals.entry(id).or_default();
    }

    pub fn add_udo(&mut self, name: &str) -> bool {
        self.udos.insert(name.to_string(), ()).is_none()
    }

    /// Declare an instrument-local variable; no-op on redeclaration.
    pub fn declare_local(&mut self, instr: u32, name: &str, rate: Rate) {
        if let Some(scope) = self.locals.get_mut(&instr) {
            scope.entry(name.to_string()).or_insert(VarSym {
                name: name.to_string(),
                rate,
            });
        }
    }

    pub fn local(&self, instr: u32, name: &str) -> Option<&VarSym> {
        self.locals.get(&instr)?.get(name)
    }

    /// Dense local slot index within the owning instrument.
    pub fn local_slot(&self, instr: u32, name: &str) -> Option<u32> {
        self.locals
            .get(&instr)?
            .get_index_of(name)
            .map(|i| i as u32)
    }

    pub fn local_count(&self, instr: u32) -> usize {
        self.locals.get(&instr).map_or(0, IndexMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_ids_are_dense_and_stable() {
        let mut table = SymbolTable::new();
        let a = table.intern_global("gkfreq", Rate::Control);
        let b = table.intern_global("gasig", Rate::Audio);
        let again = table.intern_global("gkfreq", Rate::Control);
        assert_eq!(a, GlobalId(0));
        assert_eq!(b, GlobalId(1));
        assert_eq!(a, again);
        assert_eq!(table.global_count(), 2);
    }

    #[test]
    fn duplicate_instrument_id_rejected() {
        let mut table = SymbolTable::new();
        assert!(table.add_instrument(1, None));
        assert!(!table.add_instrument(1, None));
    }

    #[test]
    fn duplicate_instrument_name_rejected() {
        let mut table = SymbolTable::new();
        assert!(table.add_instrument(1, Some("pad")));
        assert!(!table.add_instrument(2, Some("pad")));
    }

    #[test]
    fn next_free_id_skips_taken() {
        let mut table = SymbolTable::new();
        table.add_instrument(1, None);
        table.add_instrument(2, None);
        assert_eq!(table.next_free_instrument_id(), 3);
        table.add_instrument(5, None);
        assert_eq!(table.next_free_instrument_id(), 3);
    }

    #[test]
    fn local_slots_are_dense_per_instrument() {
        let mut table = SymbolTable::new();
        table.add_instrument(1, None);
        table.declare_local(1, "kamp", Rate::Control);
        table.declare_local(1, "asig", Rate::Audio);
        table.declare_local(1, "kamp", Rate::Control); // redeclare
        assert_eq!(table.local_slot(1, "kamp"), Some(0));
        assert_eq!(table.local_slot(1, "asig"), Some(1));
        assert_eq!(table.local_count(1), 2);
    }

    #[test]
    fn udo_registration() {
        let mut table = SymbolTable::new();
        assert!(table.add_udo("myfilter"));
        assert!(!table.add_udo("myfilter"));
    }
}
