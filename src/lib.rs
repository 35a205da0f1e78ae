//! 模型限流仲裁库。
//!
//! 在多个各自受上游限流的 LLM 模型档位之间选出当前有余量的模型，按分钟/天
//! 双窗口跟踪本地使用量，并在上游返回限流拒绝时沿优先级回退重试。
//!
//! 对外只有函数调用边界：调用方以异步闭包提供真正的上游调用，本库负责
//! "给出一个可用模型名"与"记录一次调用结果"两件事。本地记账只是对上游
//! 真实配额窗口的尽力近似，进程重启即清零。

pub mod config;
pub mod error;
pub mod logging;
pub mod ratelimit;
pub mod util;

pub use config::Config;
pub use error::ArbiterError;
pub use ratelimit::{
    CallReport, FailureKind, FallbackOptions, FallbackOutcome, ModelCandidate, ModelQuota,
    RateLimitTracker, UsageSnapshot, default_classifier, execute_with_fallback,
    execute_with_fallback_cancellable, select_available_model,
};
