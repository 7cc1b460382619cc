//! Stream bookkeeping: state machines, the stream table and the consumer
//! handle for multi-valued streams.

mod inbound;
mod state;
mod table;

pub(crate) use inbound::InboundControl;
pub use inbound::PayloadStream;
pub use state::{Event, Half, InteractionModel, Role, StreamMachine, StreamState};
pub use table::{Side, Sink, StreamEntry, StreamTable};
