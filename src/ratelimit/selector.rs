//! 候选排序与纯选择：按优先级（或调用方显式顺序）找出第一个有余量的模型。

use crate::ratelimit::tracker::RateLimitTracker;
use crate::ratelimit::types::ModelCandidate;

/// 生成本次请求的候选顺序。
///
/// - 未给显式顺序：按 priority 升序稳定排序，同优先级保持表内原始顺序。
/// - 给了显式顺序：完全按给定顺序使用，不再排序；表中不存在的名字跳过。
pub fn plan(table: &[ModelCandidate], preferred: Option<&[String]>) -> Vec<ModelCandidate> {
    match preferred {
        Some(names) => names
            .iter()
            .filter_map(|n| table.iter().find(|c| &c.name == n).cloned())
            .collect(),
        None => {
            let mut sorted = table.to_vec();
            sorted.sort_by_key(|c| c.quota.priority);
            sorted
        }
    }
}

/// 按候选顺序返回第一个有余量的模型名，不占用名额。
///
/// 全部无余量返回 None，由调用方终结，这里不等待也不重试。请求路径上
/// 需要"判定即占位"时应改用 [`RateLimitTracker::acquire`]。
pub async fn select_available(
    tracker: &RateLimitTracker,
    candidates: &[ModelCandidate],
) -> Option<String> {
    for c in candidates {
        if tracker.is_eligible(&c.name, &c.quota).await {
            return Some(c.name.clone());
        }
    }
    None
}

/// 便捷入口：排序 + 选择一步完成。
pub async fn select_available_model(
    tracker: &RateLimitTracker,
    table: &[ModelCandidate],
    preferred: Option<&[String]>,
) -> Option<String> {
    select_available(tracker, &plan(table, preferred)).await
}
