//! Fairness counters for nondeterministic choice.
//!
//! Each `either`-style branch point in a compiled body is a *site* with its
//! own monotonically advancing counter. `next(site, k)` yields
//! `counter mod k` and then advances, so the chosen alternative rotates
//! round-robin across attempts. The counter advances whether the attempt
//! commits or aborts; a section that aborts on one branch tries a different
//! branch on retry instead of livelocking on the same one.

use std::collections::HashMap;

/// Per-context map from branch site to its round-robin counter.
#[derive(Debug, Default)]
pub struct FairnessCounters {
    counters: HashMap<String, u64>,
}

impl FairnessCounters {
    /// Next alternative index in `[0, modulus)` for `site`, advancing the
    /// counter. `modulus` must be non-zero.
    pub fn next(&mut self, site: &str, modulus: usize) -> usize {
        debug_assert!(modulus > 0, "branch site {site} with zero alternatives");
        let counter = match self.counters.get_mut(site) {
            Some(c) => c,
            None => self.counters.entry(site.to_string()).or_insert(0),
        };
        let choice = (*counter % modulus as u64) as usize;
        *counter = counter.wrapping_add(1);
        choice
    }
}
