pub mod backup;
pub mod list;
pub mod prune;
pub mod restore;
pub mod restore_test;
pub mod watchdog;
