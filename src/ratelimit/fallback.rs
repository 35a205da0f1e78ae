//! 回退重试循环：对一个逻辑请求驱动"选模型 → 调用 → 按失败类型处置"的状态机。
//!
//! 同一请求内的尝试严格串行，不做并行投机调用；跨请求之间不提供任何顺序保证。

use crate::config::Config;
use crate::error::ArbiterError;
use crate::ratelimit::selector;
use crate::ratelimit::tracker::RateLimitTracker;
use crate::ratelimit::types::ModelCandidate;
use futures::FutureExt;
use std::future::Future;
use std::time::Duration;

/// 失败分类：限流拒绝可在本层回退重试，其余错误一律立即上抛。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Other,
}

/// 默认分类器：按错误链上的消息特征识别限流拒绝（"rate limit"、
/// "resource_exhausted" 或 429 标记）。
///
/// 这是对 Gemini 错误形态的经验复刻；接入其它上游时调用方应自带分类器，
/// 仲裁核心本身不绑定任何供应商的错误格式。
pub fn default_classifier(err: &anyhow::Error) -> FailureKind {
    let rate_limited = err.chain().any(|cause| {
        let msg = cause.to_string().to_lowercase();
        msg.contains("rate limit") || msg.contains("resource_exhausted") || msg.contains("429")
    });
    if rate_limited {
        FailureKind::RateLimited
    } else {
        FailureKind::Other
    }
}

/// 一次上游调用的成功结果：业务载荷 + 本次调用的 token 估算值。
#[derive(Debug)]
pub struct CallReport<T> {
    pub payload: T,
    pub token_estimate: u64,
}

/// 回退循环成功的产出：实际承接请求的模型、载荷与总调用次数。
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub model: String,
    pub payload: T,
    pub attempts: usize,
}

/// 回退循环参数。
#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// 显式候选顺序。给定则完全按此顺序，不再按 priority 排序。
    pub preferred_models: Option<Vec<String>>,
    /// 限流失败的尝试次数上限。
    pub max_attempts: usize,
    /// 线性退避基准：第 n 次限流失败后等待 base_delay * n。
    pub base_delay: Duration,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            preferred_models: None,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl FallbackOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            preferred_models: None,
            max_attempts: cfg.retry_max_attempts,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        }
    }
}

/// 不带取消信号的入口，其余语义同 [`execute_with_fallback_cancellable`]。
pub async fn execute_with_fallback<T, F, Fut, C>(
    tracker: &RateLimitTracker,
    table: &[ModelCandidate],
    opts: &FallbackOptions,
    classify: C,
    perform_call: F,
) -> Result<FallbackOutcome<T>, ArbiterError>
where
    F: FnMut(&str) -> Fut,
    Fut: Future<Output = anyhow::Result<CallReport<T>>>,
    C: Fn(&anyhow::Error) -> FailureKind,
{
    execute_with_fallback_cancellable(
        tracker,
        table,
        opts,
        classify,
        std::future::pending::<()>(),
        perform_call,
    )
    .await
}

/// 对一个逻辑请求驱动回退重试循环。
///
/// - 选不出模型：立即返回 [`ArbiterError::NoModelsAvailable`]，不发起调用
///   也不等待（与单次调用被上游限流是两种终态）。
/// - 限流失败：该模型的名额保持占用（零 token），让后续选择避开它；
///   线性退避后回到选择阶段。
/// - 其它失败：回滚名额并原样上抛，重试策略归调用方。
/// - 超时语义归调用方：超时错误按分类器的判定处置，默认视同其它失败。
/// - cancel 在退避等待或上游调用期间完成时，立即以
///   [`ArbiterError::Cancelled`] 终止并回滚未完成的占位。
pub async fn execute_with_fallback_cancellable<T, F, Fut, C>(
    tracker: &RateLimitTracker,
    table: &[ModelCandidate],
    opts: &FallbackOptions,
    classify: C,
    cancel: impl Future<Output = ()>,
    mut perform_call: F,
) -> Result<FallbackOutcome<T>, ArbiterError>
where
    F: FnMut(&str) -> Fut,
    Fut: Future<Output = anyhow::Result<CallReport<T>>>,
    C: Fn(&anyhow::Error) -> FailureKind,
{
    let candidates = selector::plan(table, opts.preferred_models.as_deref());
    let cancel = cancel.fuse();
    futures::pin_mut!(cancel);

    let mut attempts = 0usize;
    loop {
        let Some(model) = tracker.acquire(&candidates).await else {
            return Err(ArbiterError::NoModelsAvailable);
        };
        if attempts > 0 {
            tracing::info!(model = %model, "切换至备用模型");
        }

        let result = tokio::select! {
            _ = &mut cancel => {
                tracker.release(&model).await;
                return Err(ArbiterError::Cancelled);
            }
            r = perform_call(&model) => r,
        };

        match result {
            Ok(report) => {
                tracker.commit_tokens(&model, report.token_estimate).await;
                tracing::info!(
                    model = %model,
                    tokens = report.token_estimate,
                    "上游调用成功"
                );
                return Ok(FallbackOutcome {
                    model,
                    payload: report.payload,
                    attempts: attempts + 1,
                });
            }
            Err(err) => match classify(&err) {
                FailureKind::RateLimited => {
                    attempts += 1;
                    tracing::warn!(model = %model, attempts, "命中上游限流，准备回退");
                    if attempts >= opts.max_attempts {
                        return Err(ArbiterError::exhausted(attempts, err));
                    }
                    let delay = opts.base_delay * attempts as u32;
                    tokio::select! {
                        _ = &mut cancel => return Err(ArbiterError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                FailureKind::Other => {
                    tracker.release(&model).await;
                    return Err(ArbiterError::Call(err));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::types::ModelQuota;
    use anyhow::anyhow;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn candidate(name: &str, rpm: u32, priority: u32) -> ModelCandidate {
        ModelCandidate {
            name: name.to_string(),
            quota: ModelQuota {
                rpm,
                tpm: 1_000_000,
                rpd: 1_000,
                priority,
            },
        }
    }

    fn opts(max_attempts: usize) -> FallbackOptions {
        FallbackOptions {
            preferred_models: None,
            max_attempts,
            base_delay: Duration::from_millis(1000),
        }
    }

    fn usage_of(snap: &[crate::ratelimit::UsageSnapshot], model: &str) -> (usize, u64) {
        snap.iter()
            .find(|s| s.model == model)
            .map(|s| (s.requests_this_minute, s.tokens_this_minute))
            .unwrap_or((0, 0))
    }

    #[test]
    fn options_follow_config_knobs() {
        let cfg = Config {
            retry_max_attempts: 5,
            retry_base_delay_ms: 200,
            enforce_tpm: false,
            debug: "off".to_string(),
            models: Vec::new(),
        };

        let o = FallbackOptions::from_config(&cfg);
        assert_eq!(o.max_attempts, 5);
        assert_eq!(o.base_delay, Duration::from_millis(200));

        let d = FallbackOptions::default();
        assert_eq!(d.max_attempts, 3);
        assert_eq!(d.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn classifier_matches_rate_limit_shapes_only() {
        assert_eq!(
            default_classifier(&anyhow!("Too Many Requests: rate limit exceeded")),
            FailureKind::RateLimited
        );
        assert_eq!(
            default_classifier(&anyhow!("status 429")),
            FailureKind::RateLimited
        );
        assert_eq!(
            default_classifier(&anyhow!("RESOURCE_EXHAUSTED: quota exceeded")),
            FailureKind::RateLimited
        );
        assert_eq!(
            default_classifier(&anyhow!("connection refused")),
            FailureKind::Other
        );
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_next_model_on_rate_rejection() {
        let tracker = RateLimitTracker::new();
        let table = vec![candidate("a", 1, 1), candidate("b", 1, 2)];

        let out = execute_with_fallback(&tracker, &table, &opts(3), default_classifier, |model| {
            let model = model.to_string();
            async move {
                if model == "a" {
                    Err(anyhow!("rate limit exceeded"))
                } else {
                    Ok(CallReport {
                        payload: "analysis".to_string(),
                        token_estimate: 7,
                    })
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out.model, "b");
        assert_eq!(out.payload, "analysis");
        assert_eq!(out.attempts, 2);

        // a 留下一次零 token 的占用记录，b 记入实际估算值。
        let snap = tracker.snapshot().await;
        assert_eq!(usage_of(&snap, "a"), (1, 0));
        assert_eq!(usage_of(&snap, "b"), (1, 7));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_exactly_max_attempts() {
        let tracker = RateLimitTracker::new();
        let table = vec![candidate("a", 10, 1), candidate("b", 10, 2)];
        let calls = Arc::new(Mutex::new(0usize));

        let counted = calls.clone();
        let err = execute_with_fallback(&tracker, &table, &opts(3), default_classifier, move |_| {
            let counted = counted.clone();
            async move {
                *counted.lock().unwrap() += 1;
                Err::<CallReport<()>, _>(anyhow!("rate limit"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ArbiterError::ExhaustedRetries { attempts: 3, .. }
        ));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn other_failure_short_circuits_and_releases_the_slot() {
        let tracker = RateLimitTracker::new();
        let table = vec![candidate("a", 10, 1), candidate("b", 10, 2)];
        let calls = Arc::new(Mutex::new(0usize));

        let counted = calls.clone();
        let err = execute_with_fallback(&tracker, &table, &opts(3), default_classifier, move |_| {
            let counted = counted.clone();
            async move {
                *counted.lock().unwrap() += 1;
                Err::<CallReport<()>, _>(anyhow!("connection refused"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ArbiterError::Call(_)));
        assert_eq!(*calls.lock().unwrap(), 1);
        // 未完成的尝试不留痕。
        let snap = tracker.snapshot().await;
        assert_eq!(usage_of(&snap, "a"), (0, 0));
    }

    #[tokio::test]
    async fn no_candidate_means_no_call_at_all() {
        let tracker = RateLimitTracker::new();
        let table = vec![candidate("a", 1, 1)];
        tracker.record_usage("a", 0).await;
        let calls = Arc::new(Mutex::new(0usize));

        let counted = calls.clone();
        let err = execute_with_fallback(&tracker, &table, &opts(3), default_classifier, move |_| {
            let counted = counted.clone();
            async move {
                *counted.lock().unwrap() += 1;
                Ok(CallReport {
                    payload: (),
                    token_estimate: 0,
                })
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ArbiterError::NoModelsAvailable));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_order_is_respected_by_the_loop() {
        let tracker = RateLimitTracker::new();
        let table = vec![candidate("a", 10, 1), candidate("b", 10, 2)];
        let opts = FallbackOptions {
            preferred_models: Some(vec!["b".to_string(), "a".to_string()]),
            ..opts(3)
        };

        let out = execute_with_fallback(&tracker, &table, &opts, default_classifier, |model| {
            let model = model.to_string();
            async move {
                Ok(CallReport {
                    payload: model.clone(),
                    token_estimate: 1,
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(out.model, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_aborts_the_loop() {
        let tracker = RateLimitTracker::new();
        let table = vec![candidate("a", 10, 1)];

        // 第一次限流失败后进入 1s 退避，取消信号在 500ms 时触发。
        let err = execute_with_fallback_cancellable(
            &tracker,
            &table,
            &opts(3),
            default_classifier,
            tokio::time::sleep(Duration::from_millis(500)),
            |_| async { Err::<CallReport<()>, _>(anyhow!("rate limit")) },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ArbiterError::Cancelled));
    }
}
