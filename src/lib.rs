//! Client-side orchestration for container image scanning and Kubernetes
//! manifest validation against a hosted policy backend.

pub mod cli;
pub mod client;
pub mod errors;
pub mod events;
pub mod image;
pub mod resource;
pub mod scan;
pub mod validate;
