pub mod api;
pub mod app;
pub mod backend;
pub mod config;
pub mod grpc;
pub mod logging;
pub mod middleware;
pub mod state;
