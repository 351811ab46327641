//! CLI command implementations

pub mod config;
pub mod gc;
pub mod serve;
pub mod status;

pub use config::execute as config;
pub use gc::execute as gc;
pub use serve::execute as serve;
pub use status::execute as status;
