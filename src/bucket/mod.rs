pub mod manager;
pub mod ring;

pub use manager::{BucketEvent, BucketManager};
pub use ring::{desired_buckets, HashRing};
