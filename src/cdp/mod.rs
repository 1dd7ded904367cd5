//! The CDP transport layer: wire codec, dispatcher actor, session manager,
//! and typed event streams.

pub mod codec;
pub mod dispatcher;
pub mod events;
pub mod session;

pub use codec::{discover_websocket_url, list_targets_http, HttpTargetInfo, VersionInfo};
pub use dispatcher::{Cancel, CancelHandle, Connection, RawEvent, Subscription};
pub use events::{console, exceptions, navigation, network, ConsoleEvent, EventStream, ExceptionEvent, NavigationEvent, NetworkEvent};
pub(crate) use events::raw_stream;
pub use session::{SessionManager, TargetInfo};
