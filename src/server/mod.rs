//! Client-facing transport: the streamable JSON-RPC server, the
//! hub→instance proxy layer, and the worker pools behind fan-out.

pub mod proxy;
pub mod streamable;
pub mod workers;

pub use proxy::HubRouter;
pub use streamable::StreamableServer;
pub use workers::WorkerPool;
