pub mod connection;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod message;
pub mod service;
pub mod transaction;
pub mod transport;
pub mod watch;
pub mod wire;

pub use connection::{ConnectionId, ConnectionRecord, Connections};
pub use dispatch::Dispatcher;
pub use error::{Error, Result, names};
pub use loader::{FixedFramer, FrameStatus, Framer, MessageLoader, PrologueFramer};
pub use message::{Message, SerialCounter, SizeCounter};
pub use service::{ServiceDirectory, ServiceId};
pub use transaction::{Transaction, TransactionId, Transactions};
pub use transport::{PreallocatedSend, Transport};
pub use watch::{MainLoop, Readiness, Watch, WatchId, handle_watch_event};
