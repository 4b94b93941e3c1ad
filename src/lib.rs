pub mod cache;
pub mod config;
pub mod detection;
pub mod events;
pub mod geolocation;
pub mod input;
pub mod lifecycle;
pub mod models;
pub mod normalizer;
pub mod output;
pub mod persistence;
pub mod poller;
pub mod violations;

// Re-export commonly used types
pub use cache::ActiveSessionCache;
pub use config::Config;
pub use detection::RuleEngine;
pub use events::EventBus;
pub use geolocation::{GeoIpService, GeoResolver, NoopResolver};
pub use lifecycle::{LifecycleEngine, ReconcileOutcome};
pub use models::{CoreEvent, Rule, Session, Violation};
pub use normalizer::{Normalizer, RawSession};
pub use persistence::{SessionStore, SqliteStore};
pub use poller::{PollWorker, SessionPipeline};
pub use violations::ViolationRecorder;
