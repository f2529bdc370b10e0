pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;
mod util;

#[cfg(test)]
mod testing;
