pub mod broker;
pub mod database;

pub use broker::*;
pub use database::*;
