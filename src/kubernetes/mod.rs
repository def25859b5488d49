mod accessor;
mod client;
pub mod discovery;
mod pods;
pub mod workload;

#[cfg(test)]
pub mod fake;

pub use accessor::{ClusterAccessor, Owner};
pub use client::{KubeAccessor, connect};
pub use pods::{KubePodSource, PodEvent, PodSource};
pub use workload::{Workload, explicit_wlid};
