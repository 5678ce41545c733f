/// Realtime conversation channel: transport, wire protocol, reconnect policy
pub mod channel;
pub mod protocol;
pub mod reconnect;
pub mod transport;

pub use channel::{ChannelState, RealtimeChannel};
pub use protocol::{ClientFrame, InboundEvent, SubscribeRequest};
pub use reconnect::ReconnectPolicy;
pub use transport::{Connector, FrameStream, WsConnector};
