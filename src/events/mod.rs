pub mod publisher;

pub use publisher::{EngineEvent, EventPublisher, PublishedEvent};
