//! CLI Commands

pub mod cluster;
pub mod hub;
pub mod spoke;
pub mod token;
