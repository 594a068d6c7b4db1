pub mod adapter;
pub mod model_config;
pub mod models;
pub mod task;
pub mod text_pipeline;
