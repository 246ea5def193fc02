//! Capability Clients
//!
//! The contract the editor depends on, the event hub every implementation
//! shares, and the placeholder used when no backend is selected. Concrete
//! transports live in [`crate::transport`].

pub mod events;
pub mod no_backend;
pub mod traits;

pub use events::EventHub;
pub use no_backend::NoBackendClient;
pub use traits::CapabilityClient;
