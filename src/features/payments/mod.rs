pub mod handlers;
pub mod models;
pub mod provider;
pub mod repository;
pub mod service;
