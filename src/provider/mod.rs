//! WASM provider host: capability enforcement (C1), the host↔guest bridge
//! (C2), provider runtime instantiation (C3), and the provider registry
//! (C4) — spec §4.4–§4.7.

pub mod bridge;
pub mod dispatch;
pub mod enforcer;
pub mod manifest;
pub mod registry;
pub mod runtime;

pub use dispatch::RegistryDispatch;
pub use enforcer::{CapabilityEnforcer, HttpClient, ALL_CAPABILITIES};
pub use manifest::{ManifestMetadata, ManifestSchema, ProviderManifest, ResourceTypeSchema};
pub use registry::{ProviderHandle, ProviderRegistry};
pub use runtime::ProviderRuntime;
