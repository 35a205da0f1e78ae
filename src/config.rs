use crate::ratelimit::{ModelCandidate, ModelQuota};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_MODELS_FILE: &str = "./models.toml";

/// 运行配置：启动时加载一次，之后视为不可变。
#[derive(Debug, Clone)]
pub struct Config {
    /// 限流失败的尝试次数上限。
    pub retry_max_attempts: usize,
    /// 线性退避基准（毫秒）。
    pub retry_base_delay_ms: u64,
    /// 是否把 tpm 作为资格判定门槛（默认仅记账）。
    pub enforce_tpm: bool,
    /// 日志等级开关，见 [`crate::logging::LogLevel`]。
    pub debug: String,
    /// 模型配额表。来自 models.toml，缺省为内置 Gemini 档位表。
    pub models: Vec<ModelCandidate>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<usize>,
    #[serde(alias = "RETRY_BASE_DELAY_MS")]
    retry_base_delay_ms: Option<u64>,
    #[serde(alias = "ENFORCE_TPM")]
    enforce_tpm: Option<bool>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "MODELS_FILE")]
    models_file: Option<String>,
}

/// models.toml 的文件结构：若干个 `[[models]]` 条目。
#[derive(Debug, Default, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<ModelRow>,
}

#[derive(Debug, Deserialize)]
struct ModelRow {
    name: String,
    #[serde(flatten)]
    quota: ModelQuota,
}

impl Config {
    pub fn load() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let models_file = raw
            .models_file
            .unwrap_or_else(|| DEFAULT_MODELS_FILE.to_string());

        Self {
            retry_max_attempts: raw.retry_max_attempts.unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
            retry_base_delay_ms: raw
                .retry_base_delay_ms
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            enforce_tpm: raw.enforce_tpm.unwrap_or(false),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            models: load_models(&models_file).unwrap_or_else(default_models),
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

/// 内置的 Gemini 档位配额表（上游免费档公开额度）。
pub fn default_models() -> Vec<ModelCandidate> {
    let rows = [
        ("gemini-2.5-flash-lite", 15, 250_000, 1_000, 1),
        ("gemini-2.0-flash-lite", 30, 1_000_000, 200, 2),
        ("gemini-2.0-flash", 15, 1_000_000, 1_500, 3),
        ("gemini-2.5-flash", 15, 4_000_000, 1_500, 4),
    ];
    rows.into_iter()
        .map(|(name, rpm, tpm, rpd, priority)| ModelCandidate {
            name: name.to_string(),
            quota: ModelQuota {
                rpm,
                tpm,
                rpd,
                priority,
            },
        })
        .collect()
}

fn load_models(path: &str) -> Option<Vec<ModelCandidate>> {
    if !Path::new(path).is_file() {
        return None;
    }

    let parsed = match Figment::from(Toml::file(path)).extract::<ModelsFile>() {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path, error = %e, "解析模型配额表失败，回退到内置配额表");
            return None;
        }
    };
    if parsed.models.is_empty() {
        return None;
    }

    Some(
        parsed
            .models
            .into_iter()
            .map(|row| ModelCandidate {
                name: row.name,
                quota: row.quota,
            })
            .collect(),
    )
}
