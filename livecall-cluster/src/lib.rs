pub mod relay;

pub use relay::{
    Completion, CompletionGate, DataChannelEventKind, DataChannelParams, DataChannelRelay, Envelope, NewStream, PendingSubscribe,
    RelayBus, RelayMessage, RelaySubscription, RelayedMessage, RemoveStream, RequestSubscribe, ResponseSubscribe,
    RoomDestroyed, StreamAnnouncement, SubscribeCorrelator,
};
