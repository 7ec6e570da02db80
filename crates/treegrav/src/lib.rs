//! Distributed Barnes-Hut self-gravity over a space-filling-curve
//! decomposition.
//!
//! Particles are sorted by 63-bit Morton key and split into contiguous
//! ranges, one per tree piece. Every piece builds a local tree whose
//! edges fuse with its neighbours' trees: nodes spanning several pieces
//! are reconciled through a gather/scatter on their designated owner, and
//! subtrees living elsewhere are walked through a per-group remote-object
//! cache. The result is one globally consistent tree that each piece
//! walks for its own buckets, accumulating softened accelerations and
//! potentials.

pub mod cache;
pub mod config;
pub mod direct;
pub mod dot;
pub mod error;
pub mod io;
pub mod kernel;
pub mod moments;
pub mod msg;
pub mod partition;
pub mod particle;
pub mod piece;
pub mod runtime;
pub mod sfc;
pub mod space;
pub mod tree;

pub use crate::config::SimConfig;
pub use crate::error::{GravityError, Result};
pub use crate::particle::GravityParticle;
pub use crate::runtime::{Simulation, SimulationOutput};
pub use crate::space::OrientedBox;
