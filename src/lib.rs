pub mod approval;
pub mod block;
pub mod clock;
pub mod config;
pub mod diff;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod utils;
pub mod version;

pub use error::{ErrorKind, PublishError};
pub use lifecycle::Publisher;
pub use scheduler::Scheduler;
pub use store::VersionStore;
