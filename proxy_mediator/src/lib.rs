#[macro_use]
extern crate log;

pub mod admin;
pub mod connection;
pub mod connections;
pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod message;
pub mod protocols;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) fn test_init() {
    env_logger::builder().is_test(true).try_init().ok();
}
