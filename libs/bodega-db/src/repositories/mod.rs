pub mod device_repo;
pub mod roster_repo;
pub mod team_repo;
