//! Client sessions.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────┐  add/get/delete  ┌───────────────┐
//!  │ ConnectionCache  │◀─────────────────│ DeviceSession │  (one per connection)
//!  │ (ID/name→Handle) │                  │  dispatches   │
//!  └────────┬─────────┘                  │  commands     │
//!           │ clone                      └──────▲────────┘
//!           ▼                                   │ single consumer
//!  ┌──────────────────┐   MessageSender   ┌─────┴─────────┐
//!  │  SessionHandle   │──────────────────▶│ inbound queue │
//!  └──────────────────┘   (enqueue-only)  └───────────────┘
//! ```
//!
//! - **DeviceSession**: owns the inbound queue; `write` dispatches commands,
//!   `read` drives the timeout-bounded read loop.
//! - **SessionHandle**: what other sessions see: identity, sender and
//!   subscriber map.
//! - **ConnectionCache**: maps live client IDs and names to handles.

mod device;
mod handle;
mod inbound;
mod registry;
mod types;

pub use device::{DeviceConfig, DeviceSession};
pub use handle::SessionHandle;
pub use inbound::{InboundReceiver, MessageSender, SendError, inbound_queue};
pub use registry::ConnectionCache;
pub use types::{ClientSession, ReadEvent, ReadHandler};
