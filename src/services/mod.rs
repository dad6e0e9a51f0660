pub mod analysis;
pub mod connection;
pub mod consumer;
pub mod decode;
pub mod gateway;
pub mod memory;
pub mod parser;
pub mod queue;
pub mod results;
pub mod worker;
