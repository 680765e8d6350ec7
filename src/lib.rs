pub mod app;
pub mod auth;
pub mod domain;
pub mod error;
pub mod fdsnws;
mod http;
pub mod legacy;
pub mod output;
pub mod pack;
pub mod request;
pub mod review;
pub mod router;
pub mod service;
pub mod settings;
pub mod store;
