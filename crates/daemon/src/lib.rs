// trisync-daemon library entry point.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod remote;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod workspace;
