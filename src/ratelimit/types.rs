use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// 单个模型档位的静态配额上限，进程生命周期内不可变。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelQuota {
    /// 每分钟请求数上限。
    pub rpm: u32,
    /// 每分钟 token 上限。默认仅记账不参与判定，见 `Config::enforce_tpm`。
    pub tpm: u64,
    /// 每天请求数上限，天窗口以本地时区零点为界。
    pub rpd: u32,
    /// 优先级，数值越小越先尝试。
    pub priority: u32,
}

/// 配额表中的一行。表内顺序即同优先级时的平手顺序（稳定，不做二次排序）。
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCandidate {
    pub name: String,
    pub quota: ModelQuota,
}

/// 某一时刻单个模型的使用量快照（诊断用，不触发窗口重置）。
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub model: String,
    pub requests_this_minute: usize,
    pub requests_today: usize,
    pub tokens_this_minute: u64,
}

/// 单个模型的滑动窗口使用状态。随首次访问惰性创建，进程内常驻。
#[derive(Debug)]
pub(crate) struct ModelUsage {
    pub(crate) requests_this_minute: Vec<DateTime<Utc>>,
    pub(crate) requests_today: Vec<DateTime<Utc>>,
    pub(crate) tokens_this_minute: u64,
    minute_window_start: DateTime<Utc>,
    /// 天窗口对应的本地日期，跨过本地零点即视为过期。
    day_window_start: NaiveDate,
}

impl ModelUsage {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            requests_this_minute: Vec::new(),
            requests_today: Vec::new(),
            tokens_this_minute: 0,
            minute_window_start: now,
            day_window_start: local_day(now),
        }
    }

    /// 惰性窗口重置：过期的窗口在判定前清零。重置把起点推到 now，
    /// 因此同一次过期只会清一次，不会反复累积。
    pub(crate) fn reset_stale_windows(&mut self, now: DateTime<Utc>) {
        if now.signed_duration_since(self.minute_window_start).num_seconds() >= 60 {
            self.requests_this_minute.clear();
            self.tokens_this_minute = 0;
            self.minute_window_start = now;
        }

        let today = local_day(now);
        if today > self.day_window_start {
            self.requests_today.clear();
            self.day_window_start = today;
        }
    }

    /// 配额判定（不含重置）。rpm/rpd 必查；tpm 仅在显式开启时参与。
    pub(crate) fn within(&self, quota: &ModelQuota, enforce_tpm: bool) -> bool {
        let within_rpm = self.requests_this_minute.len() < quota.rpm as usize;
        let within_rpd = self.requests_today.len() < quota.rpd as usize;
        let within_tpm = !enforce_tpm || self.tokens_this_minute < quota.tpm;
        within_rpm && within_rpd && within_tpm
    }

    /// 记一次请求：双窗口各追加一条时间戳，并累计 token 估算值。
    pub(crate) fn record(&mut self, now: DateTime<Utc>, tokens: u64) {
        self.requests_this_minute.push(now);
        self.requests_today.push(now);
        self.tokens_this_minute += tokens;
    }

    /// 回滚最近一次占用的请求名额。token 不回滚：需要回滚的路径本就记 0。
    pub(crate) fn unrecord(&mut self) {
        self.requests_this_minute.pop();
        self.requests_today.pop();
    }
}

fn local_day(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}
