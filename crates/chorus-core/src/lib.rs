pub mod errors;
pub mod ids;
pub mod message;
pub mod session;

pub use errors::DeliveryError;
pub use ids::{ConnectionId, InstanceId, SessionToken};
pub use message::{BroadcastEvent, DedupScope, Message, Sequence, Submission};
pub use session::{ClientSession, SessionPhase};
