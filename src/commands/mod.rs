//! Chat command handling.
//!
//! ```text
//! InboundText ──► parse_command ──► handler lookup ──► pairing gate ──► handler ──► ReplySink
//!                  (not a command: ignored)   (unknown: ignored)   (unpaired: denial)
//! ```

pub mod builtin;
pub mod dispatcher;
pub mod parse;

pub use builtin::{BuiltinDeps, format_uptime, register_builtins};
pub use dispatcher::{
    CommandContext, CommandDispatcher, CommandHandler, CommandInfo, DispatchOutcome,
    DispatcherBuilder, ReplySink, pairing_required_reply,
};
pub use parse::{ParsedCommand, parse_command};
