pub mod bucket;
pub mod config;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod grpc;
pub mod ident;
pub mod materializer;
pub mod membership;
pub mod model;
pub mod node;
pub mod schedule;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod transport;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("flowmesh");
}
