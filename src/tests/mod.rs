//! Multi-component scenarios: pipeline runs against the filesystem drive,
//! and full engine runs through the work queue.

mod pipeline_scenarios;
