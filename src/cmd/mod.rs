//! CLI command implementations for warmc.
//!
//! Each module corresponds to one subcommand.

pub mod compile;
pub mod serve;
pub mod status;
pub mod stop;
