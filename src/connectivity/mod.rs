//! Lifecycle of the wireless sensor link
//!
//! `state` holds the pure state machine, `manager` the task that owns the
//! transport and carries out the machine's effects.

pub mod manager;
pub mod policy;
pub mod state;

pub use manager::{ConnectionManager, ManagerConfig};
pub use policy::ReconnectionPolicy;
pub use state::{transition, ConnectionEffect, ConnectionEvent, ConnectionState, Transition};
