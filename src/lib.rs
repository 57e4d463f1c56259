pub mod app;
pub mod config;
pub mod gate;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod shared;
