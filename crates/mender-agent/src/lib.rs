pub mod capability;
pub mod crypto_adapter;
pub mod error;
pub mod scheduler;
pub mod sink;
pub mod state_machine;

pub use capability::PlatformHooks;
pub use crypto_adapter::CryptoBackendVerifier;
pub use error::AgentError;
pub use scheduler::{Scheduler, WorkKind};
pub use sink::ParserSink;
pub use state_machine::{DeploymentMachine, MachineState};
