// otad library - exposes modules for integration testing and potential reuse
//
// The daemon binary in main.rs is a thin wrapper over these modules:
// the state machine, its controller seam, the install pipeline and the
// local control API.

pub mod active_inactive;
pub mod api;
pub mod client;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod handlers;
pub mod installer;
pub mod settings;
pub mod states;

// Re-export commonly used types for convenience
pub use daemon::{Agent, AgentHandle, Daemon, Intent, Snapshot};
pub use error::AgentError;
pub use settings::{Settings, SettingsStore};
pub use states::{State, StateId, Step};
