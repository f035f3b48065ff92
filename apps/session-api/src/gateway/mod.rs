pub mod connection;
pub mod events;
pub mod fanout;
pub mod handler;
pub mod notifier;
pub mod presence;
pub mod server;
