pub mod registry;

pub use crate::models::ReceivedResponse;
pub use registry::{
    CorrelationError, CorrelationRegistry, CorrelationResult, DeliveryOutcome, RegisterOutcome,
    ResumeBatch,
};
