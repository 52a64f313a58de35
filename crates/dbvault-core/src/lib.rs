pub mod app;
pub mod cancel;
pub mod catalog;
pub mod chain;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod platform;
pub mod retention;
pub mod sandbox;
pub mod storage;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
