pub mod broadcast;
pub mod connection;
pub mod error;
pub mod ingress;
pub mod persist;
pub mod queue;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastEngine, EngineStats, StatsSnapshot};
pub use connection::{Connection, Inbound, Transport, WsTransport};
pub use error::ServerError;
pub use ingress::{IngressContext, IngressExit};
pub use persist::{PersistHandle, ReplayError};
pub use queue::{BroadcastQueue, Enqueued, OverflowPolicy};
pub use registry::{FanOutReport, RoomRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
