pub mod health;
pub mod system;
pub mod workers;
