//! Embeddable engine client.
pub mod controller;
pub mod error;
pub mod handle;
pub mod service;
pub mod stream;

pub use controller::{Client, Handle};
pub use handle::Handle as HandleApi;
