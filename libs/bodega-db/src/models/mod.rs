pub mod account;
pub mod device;
pub mod key;
pub mod roster;
pub mod team;
