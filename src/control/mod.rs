//! Control plane: liveness, membership broadcast and client routing

pub mod broadcast;
pub mod http;
pub mod index;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastReport, MembershipBroadcaster};
pub use index::PrimaryIndex;
pub use registry::{WorkerRegistry, WorkerStatus};
pub use server::ControlPlane;
