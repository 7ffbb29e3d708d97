//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod command;
pub use command::*;
mod runner;
pub use runner::*;
mod tracing_util;
pub use tracing_util::*;
mod result_ext;
pub use result_ext::*;
