//! HTTP resilience, regional routing, checkpoints and the registry mirror store.

pub mod checkpoint;
pub mod http;
pub mod region;
pub mod registry;
pub mod shutdown;

pub use checkpoint::{CheckpointError, CheckpointManager, ResumeToken, RESUME_TOKEN_VERSION};
pub use http::{
    BackoffPolicy, CatalogRequest, Clock, HttpClientConfig, HttpTransport, LastFailure, Outcome,
    RateLimit, RequestError, ResilienceClient, ReqwestTransport, SystemClock,
    TransportError, TransportResponse, VirtualClock,
};
pub use region::{should_failover, RegionConfig, RegionEndpoint, RegionalClient, RegionalResponse, RegionalRouter};
pub use registry::{MemoryMirrorStore, MirrorStore, PgMirrorStore, StoreError};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

pub const CRATE_NAME: &str = "catmirror-storage";
