#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub(crate) mod api;
pub mod app;
pub(crate) mod clients;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod store;
pub(crate) mod util;
