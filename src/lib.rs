#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
pub mod bgp;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod informer;
pub mod metrics;
pub mod parrot;
pub mod reconciler;

pub use config::Config;
pub use parrot::Parrot;
