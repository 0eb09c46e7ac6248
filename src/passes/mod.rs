//! Post-resolve passes that rewrite the atom graph before final layout.

pub mod branch_island;
