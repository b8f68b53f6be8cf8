//! Command implementations
//!
//! Each module corresponds to a subcommand in the CLI.

pub mod init_session;
pub mod listen;
pub mod scrape_thread;
