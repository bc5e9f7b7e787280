pub mod control_message;
pub mod message;
pub mod session;
