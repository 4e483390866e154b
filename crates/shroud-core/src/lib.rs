//! Session core for Shroud.
//!
//! This crate provides:
//! - The inner frame codec (28-byte header, typed bodies)
//! - The outer datagram layout keyed by connection ID
//! - A stream multiplexer with bounded reordering
//! - The session state machine and a sans-IO endpoint that drives it
//!
//! Cryptography lives in `shroud-crypto`; this crate only decides what to
//! seal, when to rekey and where bytes go.

#![forbid(unsafe_code)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod packet;
pub mod session;
pub mod stats;
pub mod stream;

pub use config::SessionConfig;
pub use endpoint::{Endpoint, Retired, SessionHandle};
pub use error::{ProtocolError, SessionError, StateError};
pub use frame::{Frame, FrameError, FrameFlags, FrameType};
pub use packet::{ConnectionId, Packet, PacketError};
pub use session::{Feedback, Session, SessionState, Transmit};
pub use stats::StatsSnapshot;
pub use stream::ReceivedData;
