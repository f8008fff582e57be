//! Workspace-level tests exercising flows that span several crates.

#[cfg(test)]
mod event_log;
#[cfg(test)]
mod replication;
