pub mod publisher;
pub mod session;
pub mod state_machine;
pub mod tracker;
