pub mod check;
pub mod common;
pub mod config;
pub mod link;
pub mod update;
