// Nightly clippy (0.1.64) considers Drop a side effect, see https://github.com/rust-lang/rust-clippy/issues/9608
#![allow(clippy::unnecessary_lazy_evaluations)]

pub mod charactercounter_types;
pub mod common;
pub mod config;
pub mod controller_runtime;
pub mod converger;
pub mod error;
pub mod owner_reference;
pub mod reconciler;
pub mod resources;
pub mod store;

pub use error::{Error, ErrorClass};
