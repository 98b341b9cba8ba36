//! Pre-forked worker pool with connection handoff.
//!
//! The master process owns the listening socket. It keeps a fixed number of
//! worker processes alive and hands each accepted connection to the worker
//! in a chosen slot, passing the socket itself over a Unix packet channel.
//!
//! # Architecture
//!
//! ```text
//!            accept()          ┌────────────────────┐
//!   clients ─────────▶ master  │ Cluster            │
//!                              │  └ Supervisor      │
//!                              │     slots[0..N]    │
//!                              └─────────┬──────────┘
//!                 SOCK_SEQPACKET + SCM_RIGHTS per worker
//!               ┌────────────────────────┼───────────────┐
//!         ┌─────▼─────┐            ┌─────▼─────┐   ┌─────▼─────┐
//!         │ slot 0    │            │ slot 1    │   │ slot N-1  │
//!         │ agent     │            │ agent     │   │ agent     │
//!         │ + server  │            │ + server  │   │ + server  │
//!         └───────────┘            └───────────┘   └───────────┘
//! ```
//!
//! # Features
//!
//! - **Stable slots**: a slot keeps its index across worker restarts
//! - **Crash recovery**: exited workers are revived with backoff and a
//!   restart budget
//! - **Startup barrier**: one callback once every worker is ready
//! - **No lost handoffs**: connections for a reviving slot wait in a
//!   bounded queue

pub mod agent;
mod cluster;
mod gate;
mod ipc;
mod policy;
mod proc;
mod protocol;
mod signals;
mod slot;
mod spawn;
mod supervisor;

#[cfg(test)]
mod testing;

pub use agent::{LocalServer, WorkerAgent, WorkerContext, run_worker_main, serve};
pub use cluster::Cluster;
pub use gate::{ReadinessGate, ReadyCallback};
pub use ipc::Channel;
pub use policy::{RestartDecision, RestartPolicy, RestartTracker};
pub use proc::{Reaped, WorkerHandle, WorkerProcess};
pub use protocol::{Connection, DEFAULT_PREFIX, Message, SlotIndex, Tags, WorkerId};
pub use signals::TerminationReason;
pub use slot::SlotPhase;
pub use spawn::{
    ENV_SLOT, EnvFactory, EventSink, PoolEvent, ProcessSpawner, Spawn, WorkerEnv, default_env,
};
pub use supervisor::{PoolConfig, PoolStatus, SlotStatus, Supervisor};
