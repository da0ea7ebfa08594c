pub mod allocation;
pub mod device;
pub mod entitlement;
pub mod rotation;
pub mod team;
