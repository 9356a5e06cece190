//! Tollbooth - a policy gateway in front of OpenAI-compatible LLM providers
//!
//! Every call is authenticated against a route catalog, checked for allowed
//! parameters, scrubbed of sensitive content, priced against a daily
//! micro-dollar budget, optionally served from a per-route cache, routed to
//! the provider with retries, and recorded as exactly one telemetry event.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod policy;
pub mod providers;
pub mod proxy;
pub mod telemetry;

pub use application::Application;
pub use error::{Error, Result};
