pub mod client;
pub mod error;
pub mod retry;

pub use client::{
    ClassificationRequest, ClientConfig, OpenAiClassifier, RemoteClassifier, DEFAULT_CONFIDENCE,
};
pub use error::{ClassificationError, ErrorKind};
pub use retry::{classify_with_retry, Attempted, RetryPolicy};
