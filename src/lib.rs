#[path = "shared/dedlog/mod.rs"]
pub mod dedlog;
#[path = "shared/lockfile/mod.rs"]
pub mod lockfile;
#[path = "shared/safe/mod.rs"]
pub mod safe;
#[path = "shared/time/mod.rs"]
pub mod time;
#[cfg(test)]
mod tests;

#[cfg(test)]
pub use tests::support;

pub mod cache;
pub mod config;
pub mod queue;
pub mod shutdown;
