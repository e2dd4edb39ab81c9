//! Publish/subscribe plumbing shared by the reader, the fusion engine and the relay.

pub mod registry;

pub use registry::{Callback, SubscriptionId, SubscriptionRegistry};
