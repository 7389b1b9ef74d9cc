/*
 * appmirror/api - defines the ArgoCD Application resource as seen by the
 * mirror, its identity, and how a mirrored entry is keyed.
 */

pub mod application;
pub use application::AppRef;
pub use application::api_resource;
pub use application::strip_transient;

pub mod key;
pub use key::DeriveError;
pub use key::Entry;
pub use key::KeyFormat;
pub use key::derive_entry;
pub use key::derive_key;
