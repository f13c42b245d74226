//! structures and functions shared by the publish and ingestion sides of the pipeline
pub mod metrics_table;
pub mod sampler;
pub mod wire_format;
