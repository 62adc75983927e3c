pub mod bridge;
pub mod config;
pub mod lookin;
pub mod mqtt;
