pub mod classify;
pub mod dynamics;
pub mod keyword;
pub mod maintenance;
pub mod profile;
pub mod query;
pub mod scoring;
pub mod simhash;
pub mod stats;
pub mod store;
pub mod types;
pub mod vector_store;
pub mod waypoints;
