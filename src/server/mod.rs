pub mod credential_handler;
pub mod probe_handler;
pub mod server;
