// Module: relay

pub mod completion_gate;
pub mod events;
pub mod relay_bus;
pub mod subscribe_correlator;

pub use completion_gate::{Completion, CompletionGate};
pub use events::{
    DataChannelEventKind, DataChannelParams, DataChannelRelay, NewStream, RelayMessage, RelayedMessage,
    RemoveStream, RequestSubscribe, ResponseSubscribe, RoomDestroyed, StreamAnnouncement,
};
pub use relay_bus::{Envelope, RelayBus, RelaySubscription};
pub use subscribe_correlator::{PendingSubscribe, SubscribeCorrelator};
