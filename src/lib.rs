pub mod config;
pub mod data;
pub mod errors;
pub mod etl;
pub mod render;
pub mod rules;
pub mod tiles;
