//! Redis Streams transport: durable delivery for aggregate- and
//! outbox-origin messages, the Lua command/projection transactions, and the
//! coordination state backing the consumer group.

pub mod command_tx;
pub mod keys;
pub mod projection_tx;
pub mod scripts;
pub mod streams;

pub use command_tx::{run_command_transaction, AppendOp, CommandTxError};
pub use projection_tx::{run_projection_transaction, ProjectionOp, ProjectionTxError};
pub use scripts::ScriptCache;
pub use streams::RedisTransport;
