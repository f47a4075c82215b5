mod mock_pipeline;
mod runner;
#[path = "../support/mod.rs"]
mod support;
