//! A client engine for the Tor control protocol: line framing, reply
//! parsing, request/response multiplexing, and asynchronous event
//! dispatch over a duplex byte stream.
//!
//! [`Controller`] is the entry point most callers want: it owns an
//! [`Engine`](mux::Engine) and exposes one method per control-protocol
//! verb. Callers who only need the framing or multiplexing primitives
//! (to build a different façade, or to test against a mock transport)
//! can use [`mux::Engine`] directly.
//!
//! ```no_run
//! use tor_control::Controller;
//!
//! # async fn run(stream: tokio::net::TcpStream) -> Result<(), tor_control::Error> {
//! let (reader, writer) = tokio::io::split(stream);
//! let controller = Controller::new(Box::new(reader), Box::new(writer));
//!
//! controller.authenticate(b"").await?;
//! let version = controller.getinfo_single("version").await?;
//! println!("connected to Tor {version}");
//! # Ok(())
//! # }
//! ```

mod codec;
mod controller;
mod dispatcher;
mod error;
mod mux;
mod reply;
mod tap;

pub use controller::{AddOnionReply, AuthChallengeReply, Controller, ProtocolInfo};
pub use dispatcher::{EventHandler, ListenerId};
pub use error::Error;
pub use mux::Engine;
pub use reply::{Reply, ReplyLine};
pub use tap::{DebugTap, TapDirection};
