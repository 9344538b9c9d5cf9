//! Clients for the two QEMU monitor sockets
//!
//! - `console` - line-oriented human monitor (HMP), prompt-delimited
//! - `qmp` - JSON machine protocol with correlation ids and events
//! - `endpoint` - where the sockets live and how to open them

pub mod console;
pub mod endpoint;
pub mod qmp;

pub use console::{
    clean_response, is_complete, is_long_running, parse_snapshot_list, validate_response, Console,
    ConsoleClient, LiveSnapshot, PROMPT,
};
pub use endpoint::{ControlStream, Endpoint};
pub use qmp::{ChannelState, QmpClient, QmpEvent, QmpGreeting, VmRunState};
