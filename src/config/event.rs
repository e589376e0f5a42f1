//! 配置变更事件模块
//!
//! 定义配置项变更事件、按 key 模式订阅的监听器，以及监听器的隔离执行与异步派发。

use regex::Regex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// 配置项变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// 新增
    Add,
    /// 修改
    Update,
    /// 删除
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => write!(f, "ADD"),
            ChangeType::Update => write!(f, "UPDATE"),
            ChangeType::Delete => write!(f, "DEL"),
        }
    }
}

/// 配置项变更事件，构造后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChangeEvent {
    /// 变更的配置 key
    pub key: String,
    /// 旧值
    pub old_value: String,
    /// 新值
    pub new_value: String,
    /// 变更类型
    pub change_type: ChangeType,
}

impl KeyChangeEvent {
    /// 新增事件
    pub fn added(key: impl Into<String>, new_value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            old_value: String::new(),
            new_value: new_value.into(),
            change_type: ChangeType::Add,
        }
    }

    /// 修改事件
    pub fn updated(
        key: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            old_value: old_value.into(),
            new_value: new_value.into(),
            change_type: ChangeType::Update,
        }
    }

    /// 删除事件
    pub fn deleted(key: impl Into<String>, old_value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            old_value: old_value.into(),
            new_value: String::new(),
            change_type: ChangeType::Delete,
        }
    }
}

impl fmt::Display for KeyChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][{}], old:[{}], new:[{}]",
            self.change_type, self.key, self.old_value, self.new_value
        )
    }
}

/// 配置变更处理函数
pub type ChangeHandler = Arc<dyn Fn(&KeyChangeEvent) + Send + Sync>;

/// 配置变更监听器
///
/// key 模式为空字符串或 `*` 时匹配所有 key；与 key 完全相等时匹配；
/// 否则按正则表达式匹配，非法的正则只做等值匹配。
pub struct PropertyChangeListener {
    key_pattern: String,
    regex: Option<Regex>,
    handler: ChangeHandler,
}

impl PropertyChangeListener {
    /// 创建监听器，正则在此处编译一次
    pub fn new(key_pattern: impl Into<String>, handler: ChangeHandler) -> Self {
        let key_pattern = key_pattern.into();
        let regex = if Self::is_match_all(&key_pattern) {
            None
        } else {
            match Regex::new(&key_pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    debug!("key模式[{}]不是合法的正则，仅做等值匹配: {}", key_pattern, e);
                    None
                }
            }
        };

        Self {
            key_pattern,
            regex,
            handler,
        }
    }

    fn is_match_all(pattern: &str) -> bool {
        pattern.is_empty() || pattern == "*"
    }

    /// key 模式
    pub fn key_pattern(&self) -> &str {
        &self.key_pattern
    }

    /// 判断事件 key 是否匹配
    pub fn matches(&self, key: &str) -> bool {
        if Self::is_match_all(&self.key_pattern) || self.key_pattern == key {
            return true;
        }
        self.regex.as_ref().is_some_and(|regex| regex.is_match(key))
    }
}

impl fmt::Debug for PropertyChangeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyChangeListener")
            .field("key_pattern", &self.key_pattern)
            .finish_non_exhaustive()
    }
}

/// 监听器列表，负责匹配与隔离执行
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<PropertyChangeListener>>>,
}

impl ListenerRegistry {
    /// 创建空的监听器列表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册监听器
    pub fn subscribe(&self, key_pattern: impl Into<String>, handler: ChangeHandler) {
        let listener = Arc::new(PropertyChangeListener::new(key_pattern, handler));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// 已注册的监听器数量
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 是否没有任何监听器
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 在当前线程依次执行所有匹配的监听器
    ///
    /// 单个监听器 panic 只记录日志，不影响其他监听器，也不会传播给调用方。
    pub fn notify(&self, owner: &str, event: &KeyChangeEvent) {
        let listeners: Vec<Arc<PropertyChangeListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners.iter().filter(|l| l.matches(&event.key)) {
            let handler = &listener.handler;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                warn!(
                    "配置源[{}]执行配置变更监听器[{}]发生panic: {}",
                    owner,
                    listener.key_pattern,
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

/// 从 panic 负载中提取可读信息
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 异步事件派发器
///
/// 每个配置源拥有一个派发器，事件按产生顺序交给一个专用后台线程执行，
/// 写入方只负责投递，不会被慢监听器阻塞。派发器销毁时后台线程随之退出。
#[derive(Debug)]
pub struct EventDispatcher {
    owner: String,
    registry: Arc<ListenerRegistry>,
    sender: Mutex<Option<mpsc::Sender<KeyChangeEvent>>>,
}

impl EventDispatcher {
    /// 创建派发器
    pub fn new(owner: impl Into<String>, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            owner: owner.into(),
            registry,
            sender: Mutex::new(None),
        }
    }

    /// 监听器列表
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// 投递事件
    pub fn dispatch(&self, event: KeyChangeEvent) {
        info!(
            "[{}]配置发生了变更: key:[{}], ov:[{}], nv:[{}], changeType:[{}]",
            self.owner, event.key, event.old_value, event.new_value, event.change_type
        );

        if self.registry.is_empty() {
            return;
        }

        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.is_none() {
            *sender = self.spawn_worker();
        }

        let undelivered = match sender.as_ref() {
            Some(tx) => tx.send(event).err().map(|e| e.0),
            None => Some(event),
        };

        if let Some(event) = undelivered {
            // 后台线程不可用时退化为同步执行
            *sender = None;
            drop(sender);
            self.registry.notify(&self.owner, &event);
        }
    }

    fn spawn_worker(&self) -> Option<mpsc::Sender<KeyChangeEvent>> {
        let (tx, rx) = mpsc::channel::<KeyChangeEvent>();
        let owner = self.owner.clone();
        let registry = Arc::clone(&self.registry);

        let spawned = std::thread::Builder::new()
            .name(format!("envkit-events-{owner}"))
            .spawn(move || {
                for event in rx {
                    registry.notify(&owner, &event);
                }
                debug!("配置源[{}]的事件派发线程已退出", owner);
            });

        match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!("配置源[{}]创建事件派发线程失败: {}", self.owner, e);
                None
            }
        }
    }
}
