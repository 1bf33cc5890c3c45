pub mod cli;
pub mod em;
pub mod io;
pub mod model;
pub mod sites;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
