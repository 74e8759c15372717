pub mod activity;
pub mod attendance;
pub mod backup_exchange;
pub mod core;
pub mod grades;
pub mod settings;
pub mod students;
pub mod teachers;
