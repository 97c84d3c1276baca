pub mod accounting;
pub mod config;
pub mod error;
pub mod ids;
pub mod observability;
pub mod session;
pub mod store;
pub mod stream;
pub mod transport;
pub mod tree;
pub mod view;
