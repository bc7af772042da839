//! Entities module - plain data types shared by the engine

pub mod frame;
pub mod ids;

pub use frame::{Frame, FramePayload, PixelBuffer};
pub use ids::{ClockId, OwnerId, OwnerRegistry};
