pub mod config;
pub mod hexapod;
pub mod messages;
pub mod runtime;
pub mod servo;
