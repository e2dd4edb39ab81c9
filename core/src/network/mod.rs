//! Link to the partner station.

pub mod relay;
pub mod state;

pub use relay::NetworkRelay;
pub use state::ConnectionState;
