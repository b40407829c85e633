pub mod appliance;
pub mod auth;
pub mod config;
pub mod error;
pub mod eventsocket;
pub mod types;

pub use appliance::{Appliance, ChangeCallback};
pub use auth::{Auth, TokenState};
pub use error::{Error, Result};
pub use eventsocket::EventSocket;
