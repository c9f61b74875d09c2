//! Push notification delivery.
//!
//! Turns chat events into per-device HTTP pushes: payload formatting, the
//! HTTP transport, fixed-delay retries and the concurrent dispatcher.
//!
//! # Example
//!
//! ```ignore
//! use palaver_push::notification::{Dispatcher, NotificationEvent};
//!
//! let dispatcher = Dispatcher::from_config(&config)?;
//! let event = NotificationEvent::broadcast("alice", "ZNC Admin", "maintenance at 10");
//! let receipt = dispatcher.dispatch(&event, registry.devices("alice"));
//! println!("{}", receipt.ack_line());
//! ```

pub mod dispatcher;
pub mod events;
pub mod payload;
pub mod push;
pub mod retry;

pub use dispatcher::{DeliveryReport, DispatchReceipt, DispatchStats, Dispatcher};
pub use events::{NotificationEvent, TargetScope};
pub use payload::PushPayload;
pub use push::{HttpPushTransport, PushRequest, PushTransport};
pub use retry::{AttemptOutcome, DeliveryOutcome, RetryPolicy, retry_with_backoff};
