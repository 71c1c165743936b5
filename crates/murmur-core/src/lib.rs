//! # Murmur Core
//!
//! Bus primitives shared by every Murmur crate.
//!
//! - [`Message`]: a named envelope with a JSON payload
//! - [`MessageBus`]: the publish/subscribe seam skills dispatch through
//! - [`LocalBus`]: in-process bus implementation
//! - [`topic`]: the message names exchanged with the rest of the assistant
//!
//! ```text
//! ┌──────────┐  emit   ┌────────────┐  deliver  ┌───────────────┐
//! │  Skill   │────────▶│ MessageBus │──────────▶│ bound handler │
//! └──────────┘         └────────────┘──────────▶│ bound handler │
//!                                               └───────────────┘
//! ```

pub mod bus;
pub mod error;
pub mod message;
pub mod topic;

pub use bus::{BoxedBus, BusHandler, LocalBus, MessageBus, SubscriptionId, bus_handler};
pub use error::{BusError, BusResult};
pub use message::Message;
