//! Command/response messaging between the dockhand controller and agents.
//!
//! The controller issues commands through a [`Correlator`]; each agent runs a
//! [`Dispatcher`] that routes them to its collaborators and answers exactly
//! once per command. Both sides reach the broker through a [`Link`] chosen
//! once per host connection: pub/sub over a [`Transport`] or ordered-log
//! streams over an [`OrderedLog`].

pub mod correlator;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod heartbeat;
pub mod log_entry;
pub mod ports;
pub mod router;
pub mod shutdown;
pub mod transport;

pub use correlator::Correlator;
pub use cursor::CursorReader;
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{CallError, SinkError, TransportError};
pub use fanout::{FanoutConfig, FanoutPolicy, MetricPublisher, MetricSink};
pub use heartbeat::HeartbeatPublisher;
pub use ports::{AgentUpdater, ContainerManager, MetricsSource};
pub use router::CommandRouter;
pub use transport::{Cursor, Link, LogEntry, MemoryBroker, OrderedLog, Subscription, Transport};
