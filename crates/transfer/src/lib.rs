pub mod channel;
pub mod direct;
pub mod events;
pub mod offset;
pub mod peer;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod tuning;

pub use channel::{PeerChannel, PeerMessage, RelayChannel};
pub use direct::DirectChannel;
pub use events::{
    NoopTransferEventSink, ReceivedFile, TransferEventSink, TransferPhase, TransferProgress,
};
pub use peer::{PeerGuard, PeerLink, establish};
pub use receiver::ReceiverPipeline;
pub use sender::{SendRequest, SenderPipeline, TransferOutcome};
pub use session::{SessionRole, SessionState, TransportSession};
pub use signaling::SignalingClient;
pub use tuning::TransferTuning;
