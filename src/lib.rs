mod caption;
mod error;
mod grounding_dino;
mod model_files;
mod preprocessing;
mod response;
mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;
pub mod detector;

pub use app::start_app;
