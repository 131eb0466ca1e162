pub mod log_roll;
pub mod meta;
pub mod session;
