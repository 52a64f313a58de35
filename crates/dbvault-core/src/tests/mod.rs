mod catalog;
mod config;
mod prune_command;
mod restore_command;
