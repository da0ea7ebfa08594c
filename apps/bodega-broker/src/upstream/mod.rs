pub mod client;
pub mod credits;
pub mod token;

pub use client::{HttpSeatService, ProvisionedSeat, SeatService, UpstreamError};
