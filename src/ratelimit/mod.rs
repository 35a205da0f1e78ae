//! 模型限流仲裁模块。
//!
//! 目标：在多个各自受上游限流的模型档位之间做确定性选择，本地按分钟/天
//! 双窗口记账，并在上游限流拒绝时沿候选顺序回退，重试有界、退避线性。

mod fallback;
mod selector;
mod tracker;
mod types;

pub use fallback::{
    CallReport, FailureKind, FallbackOptions, FallbackOutcome, default_classifier,
    execute_with_fallback, execute_with_fallback_cancellable,
};
pub use selector::{plan, select_available, select_available_model};
pub use tracker::RateLimitTracker;
pub use types::{ModelCandidate, ModelQuota, UsageSnapshot};
