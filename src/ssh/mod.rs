pub mod breaker;
pub mod client;
pub mod known_hosts;
pub mod pool;
pub mod retry;
pub mod transfer;

pub use client::SshClient;
pub use pool::SshPool;
