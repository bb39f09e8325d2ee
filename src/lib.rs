#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod broker;
pub mod cloudflare;
pub mod config;
pub mod error;
pub mod gateway;
pub mod reconciler;
pub mod services;
pub mod status;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use error::{CarryError, Result};
