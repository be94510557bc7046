pub mod booking;
pub mod session;
