pub mod progress;
pub mod retry;

pub use progress::{ProgressThrottle, format_bytes, format_duration};
pub use retry::{classify, ErrorCategory, RetryDecision, RetryPolicy};
