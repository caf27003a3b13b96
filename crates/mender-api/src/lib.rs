pub mod capability;
pub mod client;
pub mod error;

pub use capability::{ArtifactSink, CryptoBackend, IdentityProvider};
pub use client::{DeploymentCheckOutcome, InventoryAttribute, MenderApiClient, SIGNATURE_HEADER};
pub use error::{ApiError, CapabilityError};
