pub mod analyzer;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod utils;

pub use analyzer::{GeminiSettings, SoilAnalyzer};
pub use error::AnalysisError;
pub use llm::media::ImageInput;
pub use llm::types::{AnalysisResult, ChatMessage, ChatRole};
