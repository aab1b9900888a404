//! Server side of the nerve daemon: wire protocol types, the engine
//! dispatcher, command handlers, the session registry and the proxy
//! manager. Transports (Unix/TCP) live in `nerve-transport` and drive the
//! [`engine::Engine`] through [`protocols::Command`] values.

pub mod engine;
pub mod error;
pub mod handlers;
pub mod protocols;
pub mod proxy;
pub mod session_registry;
pub mod validation;

pub use engine::{Engine, EngineConfig};
pub use error::{Result, ServerError};
pub use protocols::{Command, CommandResult, CommandType, Event, EventSink, EventType};
pub use proxy::{ProviderConfig, ProxyManager};
pub use session_registry::SessionRegistry;
