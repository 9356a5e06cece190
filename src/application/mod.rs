//! Process wiring: settings, gateway state, background tasks and the server

pub mod app;

pub use app::Application;
