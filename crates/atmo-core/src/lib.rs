//! # atmo-core
//!
//! Shared vocabulary for the Atmosphere mesh: the error taxonomy, identifier
//! and timestamp helpers, and the event bus that the UI layer subscribes to.

pub mod error;
pub mod event;
pub mod types;

pub use error::{AtmoError, Result, TokenRejection};
pub use event::{Event, EventBus};
pub use types::*;
