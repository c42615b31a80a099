pub mod auth;
pub mod cli;
pub mod dashboard;
pub mod error;
pub mod graph;
pub mod logging;
pub mod mapping;
pub mod normalize;
pub mod schema;
pub mod settings;
pub mod store;
pub mod types;
