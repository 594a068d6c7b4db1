pub mod model;
pub mod qwen2;
