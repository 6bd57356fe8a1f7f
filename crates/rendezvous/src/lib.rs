pub mod config;
pub mod relay;
pub mod routes;
pub mod store;

pub use config::RendezvousConfig;
pub use routes::{router, serve};
pub use store::{JoinOutcome, LeaveOutcome, MemberId, RoomStore};
