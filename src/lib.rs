#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod app;
pub mod cli;
pub mod config;
pub mod effect;
pub mod error;
pub mod events;
pub mod ledger;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod store;
