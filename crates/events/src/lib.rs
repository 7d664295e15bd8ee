//! Deferred write queue for catalog mutations.
//!
//! Writes are published as [`MutationRecord`]s on a durable broker
//! [`Channel`] and applied later by [`Relay::drain`] through a
//! [`MutationHandler`].
//!
//! ## Backends
//! - [`RedisChannel`]: Redis lists, selected by `redis://` / `rediss://` URLs
//! - [`InMemoryChannel`]: process-local, selected by `memory://`
//!
//! ## Delivery
//! At-least-once. A record whose apply fails goes back to the head of the
//! queue when the drain window closes; after `max_redeliveries` failures it
//! is moved to the dead-letter queue instead.

pub mod channel;
pub mod connector;
pub mod memory;
pub mod record;
pub mod redis_backend;
pub mod relay;

pub use channel::{Channel, ChannelError, ChannelResult, Delivery, Requeue};
pub use connector::{connector_for_url, Connector, InMemoryConnector, RedisConnector};
pub use memory::{InMemoryBroker, InMemoryChannel};
pub use record::{Action, DecodeError, Entity, MutationRecord, RecordError, WIRE_VERSION};
pub use redis_backend::RedisChannel;
pub use relay::{ApplyError, DrainOptions, DrainReport, MutationHandler, Relay, RelayError};
