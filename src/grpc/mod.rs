pub mod cluster_service;
pub mod server;
pub mod workflow_service;

pub use server::GrpcServer;
