/// Security subsystem for the gantry gateway.
///
/// - **Secret broker**: resolves per-backend credential templates once at
///   startup and hands each transport only its own backend's credentials
pub mod secret_broker;

pub use secret_broker::{redact, Credential, CredentialSet, SecretBroker};
