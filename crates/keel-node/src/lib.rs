//! # keel-node
//! Node composition for the Keel sync engine.
//!
//! - [`config::NodeConfig`] — layered configuration (defaults, file, env)
//! - [`logging`] — tracing subscriber setup
//! - [`transport`] — framed links binding connections to byte channels
//! - [`driver::SyncDriver`] — feeds window work to pool peers and imports results
//! - [`node::SyncNode`] — wires store, pool, driver and connections together
//! - [`sim`] — in-process simulated peers for demos and tests

pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod node;
pub mod sim;
pub mod transport;

pub use config::NodeConfig;
pub use driver::SyncDriver;
pub use error::NodeError;
pub use logging::{LogFormat, init_logging};
pub use node::SyncNode;
pub use sim::{Behaviour, SimNetwork};
pub use transport::{Incoming, Link};
