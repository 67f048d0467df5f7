//! Compilation configuration.

use serde::Deserialize;

/// Options controlling a single compilation session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Worker threads the produced graph will be scheduled on.
    ///
    /// `1` disables lock insertion entirely; `> 1` enables the dependency
    /// analysis pass and lock-marker insertion.
    pub num_threads: usize,
    /// Dump intermediate trees between stages (diagnostic side channel only).
    pub debug: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            debug: false,
        }
    }
}

impl CompileConfig {
    /// True when lock insertion and weight calculation should run.
    pub fn multi_threaded(&self) -> bool {
        self.num_threads > 1
    }
}
