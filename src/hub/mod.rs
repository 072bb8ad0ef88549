//! Subscription Fan-out
//!
//! Delivers each normalized event to every subscriber of its feed, through the
//! filter that subscriber has bound.
//!
//! - **FanoutHub**: per-feed subscriber registry and delivery
//! - **Handler**: the subscriber WebSocket stream
//! - **Messages**: the outbound envelope and the stream control protocol
//!
//! ## Usage
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8090/api/v1/stream/desk-1');
//! ws.onopen = () => ws.send(JSON.stringify({type: 'subscribe', feedId: 'btc'}));
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   // {feedId, eventName, timestamp, data, filterApplied?, filterName?, matchCount?, totalCount?}
//! };
//! ```

mod handler;
mod messages;
mod registry;

pub use handler::stream_handler;
pub use messages::{ClientMessage, FilterSummary, OutboundEvent, ServerMessage};
pub use registry::{ConnectionId, FanoutHub, HubConfig, HubError, HubStats, SubscriberId};
