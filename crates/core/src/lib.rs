//! AMP core types: service graph, per-service runtime state, status rows and
//! the state store boundary shared by the state machine and its backends.

#![forbid(unsafe_code)]

pub mod columns;
pub mod graph;
pub mod runtime;
pub mod store;

pub use graph::{ClusterGraph, DiscoveredService, GraphEntry, GraphError, Mount, ServiceSpec};
pub use runtime::{
    AggregateStatus, ClusterSnapshot, ServiceLifecycle, ServiceMode, ServiceRuntimeState, ServiceStatus, Severity,
    StatusRow,
};
pub use store::{StateRecord, StateStore, StoreError, StoreResult};

/// Label carrying the owning graph name on substrate services.
pub const LABEL_GRAPH: &str = "amp.graph";
/// Label carrying the declared service name on substrate services.
pub const LABEL_SERVICE: &str = "amp.service";

pub mod prelude {
    pub use super::{
        AggregateStatus, ClusterGraph, ClusterSnapshot, GraphEntry, GraphError, ServiceLifecycle, ServiceRuntimeState,
        ServiceSpec, ServiceStatus, StateStore, StatusRow, StoreError,
    };
}
