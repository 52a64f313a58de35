pub(crate) mod backup;
pub(crate) mod daemon;
pub(crate) mod keygen;
pub(crate) mod list;
pub(crate) mod prune;
pub(crate) mod restore;
pub(crate) mod show;
pub(crate) mod test_restore;
pub(crate) mod watchdog;
