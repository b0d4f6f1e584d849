pub mod config;
pub mod counts;
pub mod detection;
pub mod errors;
pub mod model;
