//! 日志系统模块
//!
//! 提供结构化日志初始化、执行上下文（trace id 与 exec id）以及从配置环境绑定日志配置的功能。
//!
//! 日志级别过滤器可以在初始化后重新加载，配合 [`LoggingSystem::watch_environment`]
//! 在 `logging.*` 配置变更时自动生效。

use crate::config::binder::{Bindable, FieldTable};
use crate::config::convert::FromProperty;
use crate::config::environment::{Environment, StandardEnvironment};
use crate::config::event::KeyChangeEvent;
use crate::error::{BindError, ConvertError};
use log::LevelFilter;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::instrument::Instrumented;
use tracing::Instrument;
use tracing_log::AsTrace;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{fmt, prelude::*, registry, reload, EnvFilter, Layer, Registry};

type FilterLayer = reload::Layer<EnvFilter, Registry>;
type FilterHandle = reload::Handle<EnvFilter, Registry>;
type OutputLayer = Box<dyn Layer<Layered<FilterLayer, Registry>> + Send + Sync>;

/// 全局日志初始化状态
#[derive(Debug, Default)]
struct GlobalLoggingState {
    /// 是否已初始化
    initialized: bool,
    /// 初始化结果
    init_result: Option<Result<(), String>>,
    /// 当前配置
    current_config: Option<LogConfig>,
    /// 日志级别过滤器句柄，订阅器由其他代码安装时为空
    filter_handle: Option<FilterHandle>,
}

/// 全局日志状态管理器
static GLOBAL_LOGGING_STATE: OnceLock<Mutex<GlobalLoggingState>> = OnceLock::new();

fn global_state() -> std::sync::MutexGuard<'static, GlobalLoggingState> {
    GLOBAL_LOGGING_STATE
        .get_or_init(|| Mutex::new(GlobalLoggingState::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// 日志配置结构
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// 日志级别
    pub level: LevelFilter,
    /// 日志文件路径（可选）
    pub file_path: Option<PathBuf>,
    /// 是否输出到控制台
    pub console: bool,
    /// 是否使用JSON格式
    pub json_format: bool,
    /// 模块级别日志控制
    pub module_levels: HashMap<String, LevelFilter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file_path: None,
            console: true,
            json_format: false,
            module_levels: HashMap::new(),
        }
    }
}

/// 日志系统管理器
#[derive(Debug, Clone)]
pub struct LoggingSystem {
    config: LogConfig,
}

impl LoggingSystem {
    /// 初始化日志系统
    ///
    /// # 参数
    /// * `config` - 日志配置
    ///
    /// # 返回
    /// * `Result<LoggingSystem, anyhow::Error>` - 初始化结果
    ///
    /// 重复调用不会重复安装订阅器，只按新配置重新加载日志级别过滤器。
    pub fn setup_logging(config: LogConfig) -> anyhow::Result<Self> {
        let mut state = global_state();

        if state.initialized {
            if let Some(Err(e)) = &state.init_result {
                return Err(anyhow::anyhow!("日志系统之前初始化失败: {}", e));
            }
            if let Some(handle) = &state.filter_handle {
                handle
                    .reload(build_filter(&config))
                    .map_err(|e| anyhow::anyhow!("重新加载日志过滤器失败: {}", e))?;
            }
            state.current_config = Some(config.clone());
            return Ok(Self { config });
        }

        let init_result = Self::perform_initialization(&config);
        state.initialized = true;
        state.current_config = Some(config.clone());
        match init_result {
            Ok(handle) => {
                if handle.is_some() {
                    state.filter_handle = handle;
                }
                state.init_result = Some(Ok(()));
                Ok(Self { config })
            }
            Err(e) => {
                state.init_result = Some(Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// 执行实际的日志系统初始化
    fn perform_initialization(config: &LogConfig) -> anyhow::Result<Option<FilterHandle>> {
        Self::init_log_tracer()?;
        Self::init_tracing_subscriber(config)
    }

    /// 初始化 LogTracer（log crate 到 tracing 的桥接）
    fn init_log_tracer() -> anyhow::Result<()> {
        use tracing_log::LogTracer;

        static LOG_TRACER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

        let result = LOG_TRACER_INIT.get_or_init(|| LogTracer::init().map_err(|e| e.to_string()));
        match result {
            Ok(()) => Ok(()),
            // 其他代码已经安装了 log 的全局 logger
            Err(e) if e.contains("already") => Ok(()),
            Err(e) => Err(anyhow::anyhow!("LogTracer初始化失败: {}", e)),
        }
    }

    /// 初始化 tracing subscriber
    fn init_tracing_subscriber(config: &LogConfig) -> anyhow::Result<Option<FilterHandle>> {
        let (filter_layer, handle) = reload::Layer::new(build_filter(config));

        // 控制台日志输出到 stderr，stdout 留给命令输出
        let mut outputs: Vec<OutputLayer> = Vec::new();
        if config.console || config.file_path.is_none() {
            outputs.push(if config.json_format {
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_file(true)
                    .with_line_number(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_ansi(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_names(true)
                    .boxed()
            });
        }

        if let Some(file_path) = &config.file_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)
                .map_err(|e| anyhow::anyhow!("创建日志文件失败: {}", e))?;
            let file_layer = fmt::layer()
                .with_writer(Arc::new(file))
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true);
            outputs.push(if config.json_format {
                file_layer.json().boxed()
            } else {
                file_layer.boxed()
            });
        }

        let subscriber = registry().with(filter_layer).with(outputs);
        match tracing::subscriber::set_global_default(subscriber) {
            Ok(()) => {
                tracing::info!("日志系统初始化完成");
                tracing::debug!("日志配置: {:?}", config);
                Ok(Some(handle))
            }
            Err(e) => {
                // 全局订阅器已由其他代码安装，保留现有订阅器
                tracing::debug!("日志系统已经初始化过了: {}", e);
                Ok(None)
            }
        }
    }

    /// 当前实例使用的配置
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// 检查日志系统是否已初始化
    pub fn is_initialized() -> bool {
        GLOBAL_LOGGING_STATE
            .get()
            .is_some_and(|state| state.lock().unwrap_or_else(PoisonError::into_inner).initialized)
    }

    /// 获取当前日志配置（如果已初始化）
    pub fn current_config() -> Option<LogConfig> {
        GLOBAL_LOGGING_STATE.get().and_then(|state| {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .current_config
                .clone()
        })
    }

    /// 按配置环境中的 `logging.*` 初始化日志系统，并在这些配置变更时重新加载日志级别
    pub fn setup_from_environment(environment: &Arc<StandardEnvironment>) -> anyhow::Result<Self> {
        let properties = LoggingProperties::from_environment(environment)?;
        let system = Self::setup_logging(properties.to_log_config())?;
        Self::watch_environment(environment);
        Ok(system)
    }

    /// 订阅 `logging.*` 配置变更
    pub fn watch_environment(environment: &Arc<StandardEnvironment>) {
        let weak = Arc::downgrade(environment);
        Environment::subscribe(
            environment.as_ref(),
            LOGGING_KEY_PATTERN,
            Arc::new(move |event: &KeyChangeEvent| {
                let Some(environment) = weak.upgrade() else {
                    return;
                };
                match LoggingProperties::from_environment(&environment) {
                    Ok(properties) => {
                        let config = properties.to_log_config();
                        if Self::current_config().as_ref() == Some(&config) {
                            return;
                        }
                        tracing::info!("配置[{}]变更，重新加载日志配置: {:?}", event.key, properties);
                        if let Err(e) = Self::setup_logging(config) {
                            tracing::warn!("重新加载日志配置失败: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("绑定日志配置失败: {}", e),
                }
            }),
        );
    }

    /// 重置日志系统状态（主要用于测试）
    #[cfg(test)]
    pub fn reset_for_testing() {
        let mut state = global_state();
        state.initialized = false;
        state.init_result = None;
        state.current_config = None;
    }
}

/// 构造日志级别过滤器，`RUST_LOG` 中的指令优先
fn build_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(Directive::from(config.level.as_trace()));

    for (module, level) in &config.module_levels {
        match format!("{}={}", module, level.as_str().to_lowercase()).parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => tracing::warn!("忽略非法的模块日志级别[{}={}]: {}", module, level, e),
        }
    }
    filter
}

impl FromProperty for LevelFilter {
    /// 空字符串为 `Info`
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(LevelFilter::Info);
        }
        trimmed
            .parse::<LevelFilter>()
            .map_err(|e| ConvertError::new("LevelFilter", value, e))
    }
}

/// 日志配置的 key 前缀
pub const LOGGING_PREFIX: &str = "logging";

const LOGGING_KEY_PATTERN: &str = r"^logging\..*";

/// 从配置环境绑定的日志配置
///
/// | key | 说明 | 默认值 |
/// |-----|------|--------|
/// | `logging.level` | 日志级别 | `info` |
/// | `logging.console` | 是否输出到控制台，开发环境强制开启 | `true` |
/// | `logging.json` | 是否使用 JSON 格式 | `false` |
/// | `logging.file` | 日志文件路径 | 无 |
/// | `logging.modules.<module>` | 模块日志级别 | 无 |
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingProperties {
    /// 日志级别
    pub level: LevelFilter,
    /// 是否输出到控制台
    pub console: bool,
    /// 是否使用 JSON 格式
    pub json: bool,
    /// 日志文件路径
    pub file: Option<PathBuf>,
    /// 模块日志级别
    pub modules: HashMap<String, LevelFilter>,
}

impl Default for LoggingProperties {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            console: true,
            json: false,
            file: None,
            modules: HashMap::new(),
        }
    }
}

impl Bindable for LoggingProperties {
    fn describe(fields: &mut FieldTable<Self>) {
        fields.value("level", |p| &mut p.level).default("info");
        fields.value("console", |p| &mut p.console).default("true");
        fields.value("json", |p| &mut p.json).default("false");
        fields.value("file", |p| &mut p.file);
        fields.map_values("modules", |p| &mut p.modules);
    }
}

impl LoggingProperties {
    /// 从配置环境绑定日志配置，开发环境强制输出到控制台
    pub fn from_environment(environment: &Arc<StandardEnvironment>) -> Result<Self, BindError> {
        let bound = environment.bind_properties(LOGGING_PREFIX, Self::default(), false)?;
        bound.ensure_valid()?;
        let mut properties = bound.get();
        if environment.is_dev() {
            properties.console = true;
        }
        Ok(properties)
    }

    /// 转换为日志系统配置
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file_path: self.file.clone(),
            console: self.console,
            json_format: self.json,
            module_levels: self.modules.clone(),
        }
    }
}

static NEXT_EXEC_ID: AtomicU64 = AtomicU64::new(1);

/// 执行上下文
///
/// 由调用方创建并显式传递，进入其 span 后输出的每一行日志都带有 `trace_id` 与 `exec_id`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    exec_id: u64,
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceContext {
    /// 创建执行上下文，生成新的 trace id
    pub fn new() -> Self {
        Self::with_trace_id(uuid::Uuid::new_v4().simple().to_string())
    }

    /// 使用上游传入的 trace id 创建执行上下文
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            exec_id: NEXT_EXEC_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// trace id
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// 执行 id，进程内单调递增
    pub fn exec_id(&self) -> u64 {
        self.exec_id
    }

    /// 携带 trace id 与 exec id 的 span
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("ctx", trace_id = %self.trace_id, exec_id = self.exec_id)
    }

    /// 在上下文内执行同步代码
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        self.span().in_scope(f)
    }

    /// 在上下文内执行异步任务
    pub fn scope<F: Future>(&self, future: F) -> Instrumented<F> {
        future.instrument(self.span())
    }
}
