pub mod dispute_source;
pub mod gateway;
pub mod memory;
pub mod postgres;

pub use dispute_source::HttpDisputeSource;
pub use gateway::HttpGateway;
