pub mod application;
pub mod session;
pub mod user;
