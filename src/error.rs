use thiserror::Error;

/// 仲裁层的错误分类。
///
/// 每个终态都必须可区分：上层把 `NoModelsAvailable` 映射为"暂无可用模型"，
/// 把 `ExhaustedRetries` 与 `Call` 映射为"分析失败"，映射关系依赖这里的稳定性。
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// 发起调用前就没有任何候选模型有余量。不重试：状态不变的情况下重选毫无意义。
    #[error("没有可用模型：所有模型均已达到限流窗口上限，请稍后再试")]
    NoModelsAvailable,

    /// 重试次数耗尽：每次尝试都被上游限流。携带最后一次底层错误便于诊断。
    #[error("连续 {attempts} 次被上游限流，已放弃重试")]
    ExhaustedRetries {
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },

    /// 取消信号在回退等待或上游调用期间触发。
    #[error("请求已取消")]
    Cancelled,

    /// 非限流类失败（网络错误、响应异常、上游故障等）：原样上抛，本层不重试。
    #[error(transparent)]
    Call(#[from] anyhow::Error),
}

impl ArbiterError {
    pub fn exhausted(attempts: usize, source: anyhow::Error) -> Self {
        Self::ExhaustedRetries { attempts, source }
    }
}
