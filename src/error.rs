//! Error surface exposed by the hub's registration and response-listener
//! operations.

/// All possible failures reported by extension registration and
/// deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The extension reported an absent or blank canonical name.
    #[error("extension has an invalid (empty or blank) name")]
    InvalidExtensionName,

    /// An extension with the same canonical name is already registered.
    #[error("an extension with the same name is already registered")]
    DuplicateExtensionName,

    /// The extension factory failed while constructing the extension.
    #[error("extension failed to initialize")]
    ExtensionInitializationFailure,

    /// The named extension is not currently registered.
    #[error("extension is not registered")]
    ExtensionNotRegistered,

    /// The hub could not complete the operation, e.g. because it has been
    /// shut down while the registration was in flight.
    #[error("unknown registration failure")]
    Unknown,
}

/// Failure reported to a response listener instead of a response event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    /// No response arrived within the requested timeout.
    #[error("response listener timed out waiting for a response event")]
    Timeout,

    /// The hub was shut down while the listener was still registered.
    #[error("hub was shut down before a response event arrived")]
    Shutdown,
}
