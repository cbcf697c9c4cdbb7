pub mod persistence;
pub mod types;
