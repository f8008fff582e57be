mod test_ddl_alignment;
mod test_scenarios;
mod test_state_recovery;
