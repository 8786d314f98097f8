pub mod args;
pub mod sub_command;

pub use args::Cli;
pub use sub_command::{Commands, DaemonAction, Invocation};
