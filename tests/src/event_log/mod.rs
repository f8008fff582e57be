mod test_event_log_pipeline;
