//! The Rete discrimination network for the lattice rule engine.
//!
//! Facts enter through the alpha network, which filters on intra-pattern
//! constraints and deposits working-memory elements into shared alpha
//! memories. Alpha memories right-activate the beta network, where join
//! nodes combine partial matches (tokens) across patterns, negative and NCC
//! nodes gate on the absence of matches, and production nodes turn complete
//! tokens into agenda activations. Retraction walks the same topology in
//! reverse.
//!
//! Everything lives in per-session arenas addressed by integer handles
//! ([`NodeId`], [`TokenId`], [`AlphaMemId`]); back-edges are plain handles,
//! never owning references. A dangling handle is a logic error and asserts.
//!
//! Propagation is single-threaded and cooperative: `add_wme` / `remove_wme`
//! return only once the network has quiesced.

mod agenda;
mod alpha;
mod arena;
mod error;
mod network;
mod node;
mod token;

pub use agenda::{Activation, Agenda, ConflictStrategy, SalienceRecency};
pub use alpha::{AlphaArg, AlphaPredicate, AlphaTest, FieldTest, ShapeKey};
pub use arena::{AlphaMemId, NodeId, TokenId};
pub use error::ReteError;
pub use network::{NetworkObserver, NetworkStats, ReteNetwork};
pub use node::{
    BetaArg, BetaPredicate, BindingAddress, CmpOp, FieldRef, JoinTest, PredicateFn,
    ProductionSpec,
};
