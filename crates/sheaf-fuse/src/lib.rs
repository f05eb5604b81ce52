//! sheaf-fuse — collective-communication fusion for captured training
//! graphs.
//!
//! A captured backward step reduces every gradient with its own collective
//! call; at scale the per-call latency dominates the actual transfer. This
//! crate rewrites the captured graph in place to batch many small
//! reductions into few large ones while keeping the output contract
//! intact:
//!
//! ```text
//!   grad ── clone ── all_reduce ── wait ─┐
//!   grad ── clone ── all_reduce ── wait ─┼─▶ output      (before)
//!   grad ── clone ── all_reduce ── wait ─┘
//!
//!   grad ─┐                     ┌─ result ─┐
//!   grad ─┼─ pack ── all_reduce ┼─ result ─┼─▶ output    (after)
//!   grad ─┘        ── wait ──   └─ result ─┘
//! ```
//!
//! Three strategies share one driver: [`ring::RingBufferCopy`] stages
//! count-based groups through a fixed buffer pool, [`concat::Concatenation`]
//! packs them by concatenation, and [`jit::JustInTime`] sizes a fresh
//! buffer per byte-budget group. Entry point: [`driver::CommFusion`].

pub mod concat;
pub mod config;
pub mod driver;
pub mod element;
pub mod error;
mod estimate;
pub mod info;
pub mod jit;
mod rewrite;
pub mod ring;
pub mod strategy;

pub use concat::Concatenation;
pub use config::FusionOptions;
pub use driver::{CommFusion, FusionReport};
pub use element::{ElementState, FusionElement};
pub use error::FuseError;
pub use info::GraphInfo;
pub use jit::JustInTime;
pub use ring::RingBufferCopy;
pub use strategy::FusionStrategy;
