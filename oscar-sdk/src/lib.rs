//! Client engine for the OSCAR instant-messaging protocol.
//!
//! The engine owns everything between raw sockets and decoded events: the
//! connection table, FLAP/peer frame queues, SNAC dispatch, the message
//! cookie cache, ICBM messaging on channels 1 and 2, and the rendezvous
//! transport (direct IM, file transfer) a channel-2 negotiation ends in.
//! Wire codecs live in [`oscar_proto`]; this crate is the state machine
//! around them.
//!
//! ## Driving a session
//!
//! A [`Session`] is exclusively owned by one task. The usual shape:
//!
//! ```no_run
//! use oscar_sdk::{handle, Session, SessionConfig};
//! use oscar_sdk::conn::ConnType;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = SessionConfig {
//!     screen_name: "fred".into(),
//!     ..Default::default()
//! };
//! let (session, mut events) = Session::new(config);
//! let (client, _task) = handle::spawn(session);
//!
//! client.connect(ConnType::Bos, "bos.example.net:5190").await?;
//! client.send_message("bob", "hi").await?;
//! while let Some(event) = events.recv().await {
//!     // decoded protocol events: messages, presence, rendezvous, ...
//!     let _ = event;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Embedders that want to drive the loop themselves (or test without
//! sockets) can hold the `Session` directly: feed frames with
//! [`Session::push_incoming`], pump [`Session::dispatch_incoming`], and
//! flush with [`Session::flush`].
//!
//! Nothing in this crate is fatal to the process. Transport errors surface
//! as connection status bits, malformed frames degrade or close one
//! connection, and protocol-logic surprises (unknown families, unknown
//! capabilities, uncached cookies) are logged and dropped.

pub mod config;
pub mod conn;
pub mod cookie;
pub mod dispatch;
pub mod event;
pub mod handle;
pub mod modules;
pub mod reqcache;
pub mod rendezvous;
pub mod session;
pub mod socks;

mod reader;

pub use config::{SessionConfig, SocksProxy};
pub use conn::{ConnId, ConnStatus, ConnType, RendezvousKind};
pub use cookie::{CookieCache, CookieData, CookieKind};
pub use dispatch::{Module, Registry, SUBTYPE_DEFAULT};
pub use event::{Event, IncomingMessage, RendezvousPayload};
pub use handle::{Command, SessionHandle};
pub use modules::icbm::{MessageOptions, RendezvousOffer};
pub use session::{Readiness, Session, WireFrame};

pub use oscar_proto as proto;
