#![doc = include_str!("../README.md")]
use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod align;
pub mod emit;
pub mod error;
pub mod eval;
pub mod features;
pub mod lexicon;
pub mod progress;
pub mod sexpr;
pub mod tree;
pub mod wagon;
pub mod wfst;

pub use error::LtsError;
pub use lexicon::Lexicon;

/// Convenience function to setup logging for any binaries I create.
/// Automatically sets all binaries and the trainer library crate to `info`
/// logging by default.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("lts_trainer=info,trainer=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
