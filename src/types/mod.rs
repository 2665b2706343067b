mod access;
mod models;

pub use access::{AccessLevel, ChannelName, GlobalRole, Role};
pub use models::*;
