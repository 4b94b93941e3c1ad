pub mod event;
pub mod rule;
pub mod session;
pub mod violation;

pub use event::{CoreEvent, ServerStatus};
pub use rule::{Rule, RuleType};
pub use session::{
    cache_key, DeviceInfo, MediaInfo, MediaType, Session, SessionState, StreamDecision,
    StreamQuality,
};
pub use violation::{Severity, Violation, ViolationResult};
