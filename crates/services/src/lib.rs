pub mod admission;
pub mod auth;
pub mod usage;
