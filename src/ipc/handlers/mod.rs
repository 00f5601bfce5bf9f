pub mod attendance;
pub mod backup_exchange;
pub mod batches;
pub mod core;
pub mod invitations;
pub mod rankings;
pub mod session;
pub mod setup;
pub mod students;
pub mod tasks;
pub mod teachers;
