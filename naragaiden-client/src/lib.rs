pub mod clock;
pub mod config;
pub mod fetch;
pub mod launch;
pub mod refresh;
pub mod render;
pub mod store;
