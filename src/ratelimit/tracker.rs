use crate::ratelimit::types::{ModelCandidate, ModelQuota, ModelUsage, UsageSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 限流记账器：集中维护各模型的滑动窗口使用量，并提供原子的"判定即占位"。
///
/// 注册表由组装方显式构造并注入，不做全局单例；所有操作对任意模型名都是
/// 全函数，未知模型在首次访问时以零用量惰性创建。锁内只做内存读写，
/// 不跨越任何 I/O 或等待类挂起点。
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    inner: RwLock<Inner>,
    enforce_tpm: bool,
}

#[derive(Debug, Default)]
struct Inner {
    usage: HashMap<String, ModelUsage>,
}

impl Inner {
    fn entry_for(&mut self, model: &str, now: DateTime<Utc>) -> &mut ModelUsage {
        self.usage
            .entry(model.to_string())
            .or_insert_with(|| ModelUsage::new(now))
    }
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// enforce_tpm：把 tpm 从"仅记账"升级为参与资格判定的门槛（显式开启）。
    pub fn with_enforce_tpm(enforce_tpm: bool) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            enforce_tpm,
        }
    }

    /// 判断模型当前是否有余量。惰性重置过期窗口，但不消耗名额。
    pub async fn is_eligible(&self, model: &str, quota: &ModelQuota) -> bool {
        self.is_eligible_at(model, quota, Utc::now()).await
    }

    pub(crate) async fn is_eligible_at(
        &self,
        model: &str,
        quota: &ModelQuota,
        now: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let usage = inner.entry_for(model, now);
        usage.reset_stale_windows(now);
        usage.within(quota, self.enforce_tpm)
    }

    /// 记一次完成的尝试（成功，或按策略"花掉名额"的限流失败记 0 token）。
    pub async fn record_usage(&self, model: &str, token_estimate: u64) {
        self.record_usage_at(model, token_estimate, Utc::now()).await
    }

    pub(crate) async fn record_usage_at(&self, model: &str, tokens: u64, now: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        inner.entry_for(model, now).record(now, tokens);
    }

    /// 按给定顺序找到第一个有余量的模型并当场占用一次请求名额。
    ///
    /// 判定与占位在同一次写锁临界区内完成，并发请求不可能同时拿到
    /// 最后一个名额。全部无余量时返回 None。
    pub async fn acquire(&self, candidates: &[ModelCandidate]) -> Option<String> {
        self.acquire_at(candidates, Utc::now()).await
    }

    pub(crate) async fn acquire_at(
        &self,
        candidates: &[ModelCandidate],
        now: DateTime<Utc>,
    ) -> Option<String> {
        let mut inner = self.inner.write().await;
        for c in candidates {
            let usage = inner.entry_for(&c.name, now);
            usage.reset_stale_windows(now);
            if usage.within(&c.quota, self.enforce_tpm) {
                usage.record(now, 0);
                return Some(c.name.clone());
            }
        }
        None
    }

    /// 成功完成后补记 token 消耗。名额已在 `acquire` 时占用，这里只加 token。
    pub async fn commit_tokens(&self, model: &str, tokens: u64) {
        let mut inner = self.inner.write().await;
        if let Some(usage) = inner.usage.get_mut(model) {
            usage.tokens_this_minute += tokens;
        }
    }

    /// 调用未完成（非限流失败或取消）时回滚 `acquire` 占用的名额。
    pub async fn release(&self, model: &str) {
        let mut inner = self.inner.write().await;
        if let Some(usage) = inner.usage.get_mut(model) {
            usage.unrecord();
        }
    }

    /// 所有已跟踪模型的使用量快照，按模型名排序。
    pub async fn snapshot(&self) -> Vec<UsageSnapshot> {
        let inner = self.inner.read().await;
        let mut out: Vec<UsageSnapshot> = inner
            .usage
            .iter()
            .map(|(name, u)| UsageSnapshot {
                model: name.clone(),
                requests_this_minute: u.requests_this_minute.len(),
                requests_today: u.requests_today.len(),
                tokens_this_minute: u.tokens_this_minute,
            })
            .collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }
}
