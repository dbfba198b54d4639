//! `eventhub` is an in-process, single-writer event-dispatch and
//! shared-state coordination core for modular SDKs.
//!
//! It accepts [`Event`]s from public APIs and from registered
//! [`Extension`]s, orders them globally, runs a preprocessing pipeline, fans
//! them out to each extension's private serial queue, and mediates versioned
//! shared-state snapshots that extensions publish and query against a
//! specific event.
//!
//! The entry point is [`EventHub`]: build one per SDK instance, register
//! extensions, start it, shut it down when the SDK goes away.
//!
//! ```no_run
//! use eventhub::{Event, EventHub, Extension};
//!
//! struct Lifecycle;
//!
//! impl Extension for Lifecycle {
//!     fn name(&self) -> &str {
//!         "com.example.lifecycle"
//!     }
//! }
//!
//! # async fn example() {
//! let hub = EventHub::new();
//! hub.register_extension(|_api| Ok(Box::new(Lifecycle) as Box<dyn eventhub::Extension>))
//!     .await
//!     .expect("registration should succeed");
//! hub.start();
//! hub.dispatch(Event::new("launch", "com.example.eventType.app", "com.example.eventSource.launch"));
//! # }
//! ```

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod error;
pub mod event;
pub mod extension;
pub mod history;
pub mod hub;
pub mod state;

mod container;
mod response;

pub use crate::api::ExtensionApi;
pub use crate::error::{RegistrationError, ResponseError};
pub use crate::event::{event_source, event_type, Event, EventData};
pub use crate::extension::{EventListener, Extension, ExtensionFactory, ExtensionInfo};
pub use crate::history::{EventHistory, EventHistoryRequest, InMemoryEventHistory};
pub use crate::hub::{
    EventHub, EventHubBuilder, EventPreprocessor, WrapperType, EVENT_HUB_NAME,
};
pub use crate::response::ResponseHandler;
pub use crate::state::{
    SharedStateKind, SharedStateManager, SharedStateResolution, SharedStateResolver,
    SharedStateResult, SharedStateStatus, VERSION_LATEST,
};
