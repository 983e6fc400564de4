//! WebRTC session layer
//!
//! Publishers connect as [`Pusher`]s and subscribers as [`Puller`]s fed from
//! a Pusher's relay tracks. Pushers register in a per-node
//! [`SessionRegistry`] once connected. [`RtcService`] ties sessions to the
//! room directory and to the relay bus, so a subscriber on one node can pull
//! from a publisher on another.
//!
//! ## Architecture
//!
//! - **`TransportFactory`**: negotiates sessions; `WebRtcTransport` in
//!   production, `MemoryTransport` in tests
//! - **`Pusher`** / **`Puller`**: `Negotiating -> Connected -> Closed`
//! - **`RtcService`**: publish/play entry points and relay bus handlers

mod config;
pub mod notify;
mod puller;
mod pusher;
pub mod reconcile;
mod registry;
mod service;
mod track;
pub mod transport;
mod types;

pub use config::SessionConfig;
pub use puller::Puller;
pub use pusher::{Pusher, PusherHooks};
pub use registry::SessionRegistry;
pub use service::RtcService;
pub use track::TrackKind;
pub use transport::memory::MemoryTransport;
pub use transport::webrtc_rs::WebRtcTransport;
pub use transport::TransportFactory;
pub use types::{Played, Published, SessionState};
