//! Structures and graph inputs.
//!
//! - [`Configuration`] - One atomic structure with cell and periodicity
//! - [`read_extxyz`] - Extended XYZ trajectories
//! - [`neighbor_list`] - Periodic edges within a cutoff
//! - [`AtomicGraph`] - Batched model input

mod extxyz;
mod graph;
mod neighbors;
mod structure;

pub use extxyz::{parse_extxyz, read_extxyz};
pub use graph::{AtomicGraph, AtomicNumberTable};
pub use neighbors::{neighbor_list, Edge};
pub use structure::{atomic_number, chemical_symbol, diamond, Configuration};
