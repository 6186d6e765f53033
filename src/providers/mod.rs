pub mod gemini;
pub mod keyword;
pub mod local_cloud;
pub mod ollama;
pub mod traits;

pub use gemini::GeminiClient;
pub use keyword::KeywordClassifier;
pub use local_cloud::HybridGateway;
pub use ollama::OllamaClient;
pub use traits::{DeepContext, DeepGeneration, FastGeneration, IntentVerdict, ModelGateway};
