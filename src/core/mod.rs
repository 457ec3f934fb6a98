pub mod backup;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod oauth;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod terminal;
#[cfg(test)]
pub mod testing;
pub mod vault;
