#![allow(dead_code)]

pub mod oidc;
mod test_server;

pub use test_server::{SIGNING_SECRET, START_EPOCH, TestOptions, TestServer};
