use crate::orders::expiry_worker::SweepSettings;
use crate::orders::manager::ManagerConfig;
use crate::pricing::{DEFAULT_BULK_THRESHOLD, PricingPolicy};
use shared::util::secs_to_millis;
use std::path::PathBuf;
use std::time::Duration;

/// 引擎配置 - 所有可调参数
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖（`.env` 在启动时加载）：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | WORK_DIR | /var/lib/storefront | 工作目录 |
/// | DB_PATH | {WORK_DIR}/orders.redb | redb 文件 |
/// | LOG_LEVEL | info | 日志级别 (EnvFilter 语法) |
/// | LOG_DIR | - | 按天滚动的日志目录 |
/// | LEDGER_URL | - | 外部账本地址，未设置时使用内存账本 |
/// | LEDGER_TIMEOUT_MS | 10000 | 单次账本调用超时 |
/// | RESERVATION_TTL_SECS | 1800 | 库存预留有效期 |
/// | EXPIRY_SWEEP_INTERVAL_SECS | 60 | 过期清扫间隔 |
/// | PURGE_INTERVAL_SECS | 3600 | 清除任务间隔 |
/// | NOT_ISSUED_PURGE_AGE_SECS | 604800 | not_issued 订单保留时长 |
/// | PENDING_OUTER_BOUND_SECS | 86400 | pending 订单最长存活 |
/// | IDEMPOTENCY_TTL_SECS | 600 | 幂等记录有效期 |
/// | CATALOG_REFRESH_INTERVAL_SECS | 300 | 商品快照刷新间隔 |
/// | OUTBOX_SCAN_INTERVAL_SECS | 30 | 同步队列扫描间隔 |
/// | BULK_THRESHOLD | 3 | 批量价起始数量 |
/// | PROMO_CODES | - | `CODE=10,OTHER=5` |
/// | CASHBACK_PERCENT | 5 | 返现百分比 |
/// | REFERRAL_BONUS | 50 | 推荐奖励 |
/// | COURIERS | - | `id:name:HH:MM-HH:MM,...` |
/// | SHUTDOWN_TIMEOUT_MS | 10000 | 关闭超时 |
#[derive(Debug, Clone)]
pub struct Config {
    /// 工作目录
    pub work_dir: String,
    pub db_path: Option<String>,
    pub log_level: String,
    pub log_dir: Option<String>,

    // === External ledger ===
    pub ledger_url: Option<String>,
    pub ledger_timeout_ms: u64,

    // === Lifecycle timers ===
    pub reservation_ttl_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub not_issued_purge_age_secs: u64,
    pub pending_outer_bound_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub catalog_refresh_interval_secs: u64,
    pub outbox_scan_interval_secs: u64,

    // === Pricing / wallet ===
    pub bulk_threshold: u32,
    pub promo_codes: Vec<(String, f64)>,
    pub cashback_percent: f64,
    pub referral_bonus: f64,

    /// Raw courier roster
    pub couriers: String,
    pub shutdown_timeout_ms: u64,
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置或无法解析，使用默认值
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (environment, map in tests)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let float = |key: &str, default: f64| -> f64 {
            lookup(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(default)
        };
        let text = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            work_dir: text("WORK_DIR").unwrap_or_else(|| "/var/lib/storefront".into()),
            db_path: text("DB_PATH"),
            log_level: text("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_dir: text("LOG_DIR"),

            ledger_url: text("LEDGER_URL"),
            ledger_timeout_ms: num("LEDGER_TIMEOUT_MS", 10_000),

            reservation_ttl_secs: num("RESERVATION_TTL_SECS", 1800),
            expiry_sweep_interval_secs: num("EXPIRY_SWEEP_INTERVAL_SECS", 60).max(1),
            purge_interval_secs: num("PURGE_INTERVAL_SECS", 3600).max(1),
            not_issued_purge_age_secs: num("NOT_ISSUED_PURGE_AGE_SECS", 7 * 24 * 3600),
            pending_outer_bound_secs: num("PENDING_OUTER_BOUND_SECS", 24 * 3600),
            idempotency_ttl_secs: num("IDEMPOTENCY_TTL_SECS", 600),
            catalog_refresh_interval_secs: num("CATALOG_REFRESH_INTERVAL_SECS", 300).max(1),
            outbox_scan_interval_secs: num("OUTBOX_SCAN_INTERVAL_SECS", 30).max(1),

            bulk_threshold: lookup("BULK_THRESHOLD")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_BULK_THRESHOLD),
            promo_codes: lookup("PROMO_CODES")
                .map(|raw| parse_promo_codes(&raw))
                .unwrap_or_default(),
            cashback_percent: float("CASHBACK_PERCENT", 5.0),
            referral_bonus: float("REFERRAL_BONUS", 50.0),

            couriers: lookup("COURIERS").unwrap_or_default(),
            shutdown_timeout_ms: num("SHUTDOWN_TIMEOUT_MS", 10_000),
        }
    }

    /// 使用自定义工作目录（测试场景）
    pub fn with_work_dir(work_dir: impl Into<String>) -> Self {
        let mut config = Self::from_lookup(|_| None);
        config.work_dir = work_dir.into();
        config
    }

    /// redb file location
    pub fn db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.work_dir).join("orders.redb"),
        }
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn outbox_scan_interval(&self) -> Duration {
        Duration::from_secs(self.outbox_scan_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            reservation_ttl_ms: secs_to_millis(self.reservation_ttl_secs),
            idempotency_ttl_ms: secs_to_millis(self.idempotency_ttl_secs),
            pending_outer_bound_ms: secs_to_millis(self.pending_outer_bound_secs),
            not_issued_purge_age_ms: secs_to_millis(self.not_issued_purge_age_secs),
            cashback_percent: self.cashback_percent,
            referral_bonus: self.referral_bonus,
        }
    }

    pub fn pricing_policy(&self) -> PricingPolicy {
        let mut policy = PricingPolicy::new(self.bulk_threshold);
        for (code, percent) in &self.promo_codes {
            policy.add_promo(code, *percent);
        }
        policy
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            sweep_interval: Duration::from_secs(self.expiry_sweep_interval_secs),
            purge_interval: Duration::from_secs(self.purge_interval_secs),
            catalog_refresh_interval: Duration::from_secs(self.catalog_refresh_interval_secs),
            ledger_timeout: self.ledger_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Parse `CODE=10,OTHER=5.5`; malformed entries are skipped with a warning
pub fn parse_promo_codes(raw: &str) -> Vec<(String, f64)> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry.split_once('=').and_then(|(code, pct)| {
                let code = code.trim();
                let pct = pct.trim().parse::<f64>().ok()?;
                (!code.is_empty() && pct.is_finite()).then(|| (code.to_uppercase(), pct))
            });
            if parsed.is_none() {
                tracing::warn!(entry = %entry, "Ignoring malformed promo code entry");
            }
            parsed
        })
        .collect()
}
