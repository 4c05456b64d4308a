pub mod app;
pub mod auth;
pub mod auth_handlers;
pub mod config;
pub mod error;
pub mod handlers;
pub mod prompt;
pub mod prompt_store;
pub mod relay;
pub mod upstream;
pub mod users;
