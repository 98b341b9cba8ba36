//! handoff - pre-forked worker pool with connection handoff.
//!
//! A master process keeps a fixed set of supervised worker processes and
//! passes accepted connections to them over Unix packet channels.
//!
//! ```no_run
//! use std::net::TcpListener;
//! use handoff::worker::{Cluster, PoolConfig};
//!
//! # fn main() -> handoff::error::Result<()> {
//! let cluster = Cluster::new(PoolConfig::new(4))?;
//! cluster.start_and_wait()?;
//!
//! let listener = TcpListener::bind("127.0.0.1:8080")?;
//! for (n, stream) in listener.incoming().enumerate() {
//!     cluster.entrust(n % cluster.concurrency(), stream?)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod echo;
pub mod error;
pub mod logging;
pub mod worker;
