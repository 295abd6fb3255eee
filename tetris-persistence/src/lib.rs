pub mod client;
pub mod service;
pub mod storage;

pub use client::PersistClient;
pub use storage::Storage;
