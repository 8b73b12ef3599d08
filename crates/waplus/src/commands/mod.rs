pub mod ingest;
pub mod jobs;
