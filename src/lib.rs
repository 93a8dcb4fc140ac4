//! # replikv
//!
//! A partitioned key-value store where every key lives on three nodes:
//! - a PRIMARY that accepts writes
//! - a SYNC replica updated before the write is acknowledged
//! - an ASYNC replica fed through a durable outbox after the ack
//!
//! There is no consensus protocol. A small control plane tracks liveness
//! and pushes versioned membership snapshots; each node then repairs its
//! own records (promotion, replica replacement, recovery) from local state.
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────────────────────┐
//!  clients ──▶│        Control plane         │
//!             │ heartbeats · membership v#   │
//!             │ put/get routing · key index  │
//!             └──────┬───────────────▲───────┘
//!        membership  │               │ heartbeat / primary changed
//!   ┌────────────────┼───────────────┼───────────────┐
//! ┌─▼──────────┐   ┌─▼──────────┐   ┌┴───────────┐
//! │ Node 1     │──▶│ Node 2     │   │ Node 3     │
//! │ PRIMARY k  │   │ SYNC k     │   │ ASYNC k    │
//! │ + outbox   │───┼────────────┼──▶│            │
//! └────────────┘   └────────────┘   └────────────┘
//!      sync replicate (before ack)   async (after ack)
//! ```
//!
//! ## Usage
//!
//! ### Start the control plane
//! ```bash
//! replikv-control serve --bind 0.0.0.0:7000 \
//!   --workers http://10.0.0.1:7001,http://10.0.0.2:7001,http://10.0.0.3:7001
//! ```
//!
//! ### Start a storage node
//! ```bash
//! replikv-node serve --id http://10.0.0.1:7001 --bind 0.0.0.0:7001 \
//!   --control http://10.0.0.9:7000 --outbox ./node-data/outbox.log
//! ```
//!
//! ### Use the CLI
//! ```bash
//! replikv put user:42 alice
//! replikv get user:42
//! replikv cluster
//! replikv status --node http://10.0.0.1:7001
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod control;
pub mod node;

pub use common::{Config, Error, Result};
pub use control::ControlPlane;
pub use node::StorageNode;
