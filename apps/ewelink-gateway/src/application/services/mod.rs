//! Application Services
//!
//! Services that coordinate the registry, the event bus and live links.
//!
//! - `MessageRelay`: Moves frames between device and cloud with key substitution
//! - `CommandService`: Operator commands (switch, kick, list, alias)

mod commands;
mod relay;

pub use commands::{CommandError, CommandService};
pub use relay::{MessageRelay, RelayError};
