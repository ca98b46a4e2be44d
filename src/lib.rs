pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod state;
pub mod streaming;
pub mod websocket;
