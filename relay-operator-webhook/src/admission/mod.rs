pub mod error;
pub mod mirror;
