//! 熔断器注册表
//!
//! 每个命名服务（"arXiv" / "LLM" / "export" 或调用方自定义）一份 CircuitState，首次引用时惰性创建。
//! 只有开 / 关两态：连续失败达到阈值即打开；距最后一次失败超过恢复时间后，下一次 check 直接重置为关闭
//! （不做半开探测，下一次失败会重新累计）。
//!
//! 注册表本身与每个服务条目各有一把锁：不同服务互不阻塞，同一服务的「读-改-写」在临界区内完成。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::SurveyError;

pub const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const CIRCUIT_BREAKER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(300);

/// 时间源（测试中可替换为 ManualClock）
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        // 超出 chrono 表示范围的推进按最大值处理
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// 阈值与恢复时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            recovery_timeout: CIRCUIT_BREAKER_RECOVERY_TIMEOUT,
        }
    }
}

/// 单个服务的熔断状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub failure_count: u32,
    pub is_open: bool,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// 进程级熔断器注册表：启动时构造一次，以 Arc 注入 GuardedCall
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    services: Mutex<HashMap<String, Arc<Mutex<CircuitState>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn entry(&self, service: &str) -> Arc<Mutex<CircuitState>> {
        let mut services = lock(&self.services);
        services
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::default())))
            .clone()
    }

    /// 检查是否允许调用：打开且未到恢复时间则返回 ExternalService 错误；
    /// 已到恢复时间则重置为关闭后放行。
    pub fn check(&self, service: &str) -> Result<(), SurveyError> {
        let entry = self.entry(service);
        let mut state = lock(&entry);
        if !state.is_open {
            return Ok(());
        }

        if self.recovery_elapsed(&state) {
            state.is_open = false;
            state.failure_count = 0;
            tracing::info!(service, "Circuit breaker closed for {}", service);
            return Ok(());
        }

        Err(
            SurveyError::external_service(service, format!("Circuit breaker is open for {service}"))
                .with_context("failure_count", state.failure_count),
        )
    }

    fn recovery_elapsed(&self, state: &CircuitState) -> bool {
        let Some(last) = state.last_failure_time else {
            return true;
        };
        match (self.clock.now() - last).to_std() {
            Ok(elapsed) => elapsed > self.config.recovery_timeout,
            // 时钟回拨：视为未到恢复时间
            Err(_) => false,
        }
    }

    /// 记录一次调用结果：成功则完全重置；失败则计数 +1，达到阈值时打开
    pub fn record(&self, service: &str, success: bool) {
        let entry = self.entry(service);
        let mut state = lock(&entry);
        if success {
            state.failure_count = 0;
            state.is_open = false;
            return;
        }

        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_time = Some(self.clock.now());
        if state.failure_count >= self.config.failure_threshold {
            state.is_open = true;
            tracing::error!(
                component = "circuit_breaker",
                service,
                failure_count = state.failure_count,
                "Circuit breaker opened for {}",
                service
            );
        }
    }

    /// 单个服务的状态快照（未知服务会被惰性创建）
    pub fn state(&self, service: &str) -> CircuitState {
        lock(&self.entry(service)).clone()
    }

    /// 所有已知服务的状态快照
    pub fn status(&self) -> BTreeMap<String, CircuitState> {
        let services = lock(&self.services);
        services
            .iter()
            .map(|(name, entry)| (name.clone(), lock(entry).clone()))
            .collect()
    }

    /// 管理 / 测试用：强制关闭并清零
    pub fn reset(&self, service: &str) {
        let known = lock(&self.services).get(service).cloned();
        if let Some(entry) = known {
            *lock(&entry) = CircuitState::default();
            tracing::info!(
                component = "circuit_breaker",
                service,
                "Circuit breaker manually reset for {}",
                service
            );
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("services", &self.status())
            .finish()
    }
}

/// 锁中毒时继续使用内部数据：状态只是计数与时间戳，不存在半写入的不变量
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
