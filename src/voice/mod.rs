//! Voice subprocess integration: the stdio line protocol, process lifecycle
//! and the router that turns process output into browser events.

pub mod process;
pub mod protocol;
pub mod router;

pub use process::{LaunchSpec, ProcessEnv, ProcessOutput, VoiceProcess};
pub use router::route;
