pub mod client;
pub mod credentials;

pub use client::{Endpoint, UpstreamClient, UpstreamConfig};
pub use credentials::{Credential, CredentialPool, CredentialStatus};
