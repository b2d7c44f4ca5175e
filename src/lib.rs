#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]

mod acceptor;
pub mod clock;
pub mod config;
pub mod error;
pub mod framer;
pub mod gap;
pub mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod resend;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ServerConfig, StorageBackend, TlsConfig};
pub use error::{FixaError, ProtocolError, Rejection, Result, SessionRejectReason};
pub use handler::{
    AllowListResolver, ApplicationHandler, IdentityResolver, NoopHandler, OpenResolver,
    SessionPermit,
};
pub use protocol::{FixMessage, MsgType};
pub use registry::{RegistryError, SessionRegistry};
pub use server::{FixServer, ServerHandle};
pub use session::{DisconnectReason, SessionHandle, SessionId, SessionStats, SessionStatus};
pub use storage::{
    Direction, FileMessageStore, MemoryMessageStore, MessageStore, StoreError,
};
