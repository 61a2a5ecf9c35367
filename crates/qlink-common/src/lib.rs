//! Common types and utilities shared across the qlink robot control stack.
//!
//! This crate provides:
//! - JSON frame model and parsing ([`frame`])
//! - Handshake and validation crypto ([`crypto`])
//! - Signaling against the robot or a proxy ([`signaling`])
//! - Topic and command catalogue ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod frame;
pub mod signaling;
pub mod types;

pub use crypto::CryptoError;
pub use frame::{Frame, FrameError, MessageKind, Payload};
pub use signaling::{HandshakeError, SessionDescription, Signaler};
