//! Issues image registry credentials for `ImagePullSecret` and
//! `ImagePushSecret` resources, rotates them regularly and authenticates
//! registry clients against the issued accounts.

pub mod auth;
pub mod cli;
pub mod controller;
pub mod crd;
pub mod docker_config;
pub mod kvp;
pub mod logging;
pub mod namespace;
pub mod password;
pub mod registry;
pub mod status;
pub mod store;
pub mod time;
pub mod utils;

// Internal re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
