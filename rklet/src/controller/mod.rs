//! Controllers that keep the cluster's view of this node and its pods
//! in step with the provider.

pub mod node;
pub mod pod;

pub use node::{
    KubeNodeClient, NodeClient, NodeController, NodeNotifier, NodeStatusErrorHandler,
    RegisterOnNotFound,
};
pub use pod::{KubePodClient, PodClient, PodController, RetryPolicy};
