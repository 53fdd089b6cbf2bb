pub mod config;
pub mod gemini;
pub mod intake;
pub mod models;
pub mod placeholder;
pub mod prompt;
pub mod routes;
pub mod studio;
