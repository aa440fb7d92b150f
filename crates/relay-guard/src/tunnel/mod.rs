//! Collaborators at the edge of the core: the status oracle, the tunnel
//! driver, and the host's routing and resolver state.

pub mod driver;
pub mod network;
pub mod status;
