pub mod common;
pub mod completions;
pub mod conflicts;
pub mod connections;
pub mod jobs;
pub mod mappings;
pub mod sync;
