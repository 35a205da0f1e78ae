use tracing_subscriber::EnvFilter;

/// 日志等级（由 DEBUG 配置项解析）：
/// - off：仅保留 warn 及以上
/// - low：本库 info
/// - medium：本库 debug
/// - high：本库 trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "info" => Self::Low,
            "medium" | "debug" => Self::Medium,
            "high" | "trace" | "all" => Self::High,
            _ => Self::Off,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Self::Off => "warn",
            Self::Low => "warn,model_arbiter=info",
            Self::Medium => "warn,model_arbiter=debug",
            Self::High => "warn,model_arbiter=trace",
        }
    }
}

/// 安装全局 tracing 订阅器。
///
/// 依赖库日志压到 warn 以降噪；RUST_LOG 存在时优先生效，但若其中未提及
/// 本库，会补一条本库的等级指令，避免关键日志被整体过滤掉。
pub fn init(cfg: &crate::config::Config) {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();

    let filter = if env.is_empty() {
        EnvFilter::new(cfg.log_level().directive())
    } else if env.contains("model_arbiter") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},model_arbiter=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}
