pub mod config;
pub mod error;
pub mod input;
pub mod lock;
pub mod log_sink;
pub mod master;
mod shared_mem;
pub mod shared_state;
pub mod spawner;
pub mod worker;
#[cfg(test)]
mod test;

pub use shared_mem::unlink_if_exists;
pub use shared_state::{Role, Session, SharedState};
pub use spawner::WorkerKind;
