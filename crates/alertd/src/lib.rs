//! Alertmanager++ publishing service.
//!
//! Wraps the [`publishing`] subsystem with the [`channels`] provider clients
//! and exposes it over HTTP (see [`server::build_router`]).

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod server;

pub use server::{build_router, AppState};
