pub mod batching;
pub mod delta;
pub mod latency;
pub mod protocol;
pub mod replication;
pub mod session;
pub mod viewers;
