pub mod connection;
pub mod fetch;
pub mod login;
pub mod status;
pub mod sync;
