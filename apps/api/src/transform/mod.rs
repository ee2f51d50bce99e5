pub mod batcher;
pub mod example_selector;
pub mod field_merge;
pub mod handlers;
pub mod markup;
pub mod orchestrator;
pub mod payload;
pub mod prompts;
pub mod reply_parser;
pub mod task;
