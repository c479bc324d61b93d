// Communication Layer: every remote call in the fleet is an envelope sent
// through `CommunicationLayer`, whatever the transport underneath.

pub mod dedup;
pub mod http;
pub mod layer;
pub mod local;
pub mod protocol;
pub mod retry;
pub mod transport;

pub use dedup::{Deduplicated, RequestWindow};
pub use http::{rpc_router, HttpTransport};
pub use layer::CommunicationLayer;
pub use local::{LocalNetwork, LocalTransport};
pub use protocol::{Envelope, Payload, Reply};
pub use retry::RetryPolicy;
pub use transport::{EnvelopeHandler, Transport};
