//! 轮询配置源模块
//!
//! 周期性地通过 [`PropertyReader`] 读取全量配置，与内存快照比较后对变化的 key 发出变更事件。
//! 轮询任务由取消令牌控制生命周期，配置源被销毁或调用 [`PollingPropertySource::shutdown`] 时退出。

use crate::config::event::{ChangeHandler, EventDispatcher, KeyChangeEvent, ListenerRegistry};
use crate::config::source::PropertySource;
use crate::error::LoadError;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 全量配置读取接口
#[async_trait]
pub trait PropertyReader: Send + Sync {
    /// 读取所有配置项
    async fn read_all(&self) -> Result<HashMap<String, String>, LoadError>;
}

/// 以闭包实现的配置读取器
pub struct FnPropertyReader<F> {
    reader: F,
}

impl<F> FnPropertyReader<F>
where
    F: Fn() -> Result<HashMap<String, String>, LoadError> + Send + Sync,
{
    /// 包装读取闭包
    pub fn new(reader: F) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<F> PropertyReader for FnPropertyReader<F>
where
    F: Fn() -> Result<HashMap<String, String>, LoadError> + Send + Sync,
{
    async fn read_all(&self) -> Result<HashMap<String, String>, LoadError> {
        (self.reader)()
    }
}

/// 轮询配置源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    /// 尚未成功加载
    Uninitialized,
    /// 已加载，未开启轮询
    Loaded,
    /// 轮询中
    Polling,
}

/// 基于轮询的配置源
pub struct PollingPropertySource {
    name: String,
    interval: Duration,
    reader: Arc<dyn PropertyReader>,
    properties: ArcSwap<HashMap<String, String>>,
    state: Mutex<PollingState>,
    loaded: AtomicBool,
    scheduled: AtomicBool,
    reload_lock: tokio::sync::Mutex<()>,
    dispatcher: EventDispatcher,
    cancel: CancellationToken,
}

impl fmt::Debug for PollingPropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingPropertySource")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PollingPropertySource {
    /// 创建轮询配置源，此时内存配置为空，需要调用 [`init`](Self::init) 完成首次加载
    ///
    /// # 参数
    /// * `name` - 配置源名称
    /// * `interval` - 轮询间隔，为零时不轮询
    /// * `reader` - 配置读取器
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        reader: Arc<dyn PropertyReader>,
    ) -> Arc<Self> {
        let name = name.into();
        let dispatcher = EventDispatcher::new(name.clone(), Arc::new(ListenerRegistry::new()));
        Arc::new(Self {
            name,
            interval,
            reader,
            properties: ArcSwap::from_pointee(HashMap::new()),
            state: Mutex::new(PollingState::Uninitialized),
            loaded: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            reload_lock: tokio::sync::Mutex::new(()),
            dispatcher,
            cancel: CancellationToken::new(),
        })
    }

    /// 创建并初始化轮询配置源
    ///
    /// # 返回
    /// * `Result<Arc<Self>, LoadError>` - 首次读取失败时返回错误
    pub async fn start(
        name: impl Into<String>,
        interval: Duration,
        reader: Arc<dyn PropertyReader>,
    ) -> Result<Arc<Self>, LoadError> {
        let source = Self::new(name, interval, reader);
        source.init().await?;
        Ok(source)
    }

    /// 执行首次加载，并在轮询间隔有效时启动轮询任务
    ///
    /// 轮询任务只会启动一次，重复调用只会重新加载。首次读取失败时错误返回给调用方，
    /// 内存配置保持为空，轮询任务仍会按间隔继续尝试。
    pub async fn init(self: &Arc<Self>) -> Result<(), LoadError> {
        let result = self.reload().await;
        self.schedule_polling();
        result
    }

    fn schedule_polling(self: &Arc<Self>) {
        if self.interval.is_zero() || self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            "调度刷新配置[{}]，刷新间隔：[{:?}]",
            self.name, self.interval
        );
        self.set_state(PollingState::Polling);

        let source = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        tokio::spawn(poll_loop(source, cancel, interval));
    }

    /// 重新读取全量配置并计算差异
    ///
    /// 首次成功加载不产生事件；读取失败时保留已有快照。变更事件交给派发线程执行，
    /// 不等待监听器完成。
    pub async fn reload(&self) -> Result<(), LoadError> {
        let _guard = self.reload_lock.lock().await;

        let fresh = match self.reader.read_all().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("配置源[{}]本次Reload失败，保留原有配置: {}", self.name, e);
                return Err(e);
            }
        };

        let previous = self.properties.swap(Arc::new(fresh));
        if !self.loaded.swap(true, Ordering::SeqCst) {
            debug!("配置源[{}]首次加载完成，共{}项", self.name, self.properties.load().len());
            if self.state() == PollingState::Uninitialized {
                self.set_state(PollingState::Loaded);
            }
            return Ok(());
        }

        let current = self.properties.load_full();
        for event in diff(&previous, &current) {
            self.dispatcher.dispatch(event);
        }
        Ok(())
    }

    /// 当前状态
    pub fn state(&self) -> PollingState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PollingState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// 轮询任务的取消令牌
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 停止轮询
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PollingPropertySource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    source: Weak<PollingPropertySource>,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(source) = source.upgrade() else {
            break;
        };
        // 失败已在 reload 中记录，保留旧快照继续轮询
        let _ = source.reload().await;
    }
    debug!("轮询配置任务已退出");
}

/// 计算新旧配置的差异，先按 key 顺序输出更新与删除，再输出新增
fn diff(previous: &HashMap<String, String>, current: &HashMap<String, String>) -> Vec<KeyChangeEvent> {
    let mut events = Vec::new();

    let old_keys: BTreeSet<&String> = previous.keys().collect();
    for key in old_keys {
        let old = &previous[key];
        match current.get(key) {
            Some(new) if new != old => events.push(KeyChangeEvent::updated(key, old, new)),
            Some(_) => {}
            None => events.push(KeyChangeEvent::deleted(key, old)),
        }
    }

    let new_keys: BTreeSet<&String> = current
        .keys()
        .filter(|key| !previous.contains_key(*key))
        .collect();
    for key in new_keys {
        events.push(KeyChangeEvent::added(key, &current[key]));
    }

    events
}

impl PropertySource for PollingPropertySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_property(&self, key: &str) -> Option<String> {
        self.properties.load().get(key).cloned()
    }

    fn each(&self, visit: &mut dyn FnMut(&str, &str) -> ControlFlow<()>) {
        let snapshot = self.properties.load_full();
        for (key, value) in snapshot.iter() {
            if visit(key, value).is_break() {
                break;
            }
        }
    }

    fn subscribe(&self, key_pattern: &str, handler: ChangeHandler) {
        self.dispatcher.registry().subscribe(key_pattern, handler);
    }
}
