pub mod hub;

pub use hub::{SignalEnvelope, SignalType, SignalingHub, DEFAULT_MAX_PARTICIPANTS};
