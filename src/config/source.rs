//! 配置源模块
//!
//! 定义配置源能力接口以及基于内存表的可变配置源实现。

use crate::config::event::{ChangeHandler, EventDispatcher, KeyChangeEvent, ListenerRegistry};
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, PoisonError, RwLock};

/// 配置源能力接口
///
/// 每个配置源有一个在集合内唯一的名称，支持单 key 查询、全量遍历以及变更订阅。
pub trait PropertySource: Send + Sync {
    /// 配置源名称
    fn name(&self) -> &str;

    /// 查询配置原始值
    ///
    /// # 参数
    /// * `key` - 配置 key
    ///
    /// # 返回
    /// * `Option<String>` - 配置值，不存在时返回 `None`
    fn get_property(&self, key: &str) -> Option<String>;

    /// 查询配置原始值，不存在时返回默认值
    fn get_property_or(&self, key: &str, default: &str) -> String {
        self.get_property(key)
            .unwrap_or_else(|| default.to_string())
    }

    /// 是否包含指定 key
    fn contains_property(&self, key: &str) -> bool {
        self.get_property(key).is_some()
    }

    /// 遍历所有配置项，访问函数返回 `ControlFlow::Break` 时提前结束
    fn each(&self, visit: &mut dyn FnMut(&str, &str) -> ControlFlow<()>);

    /// 订阅配置变更
    ///
    /// # 参数
    /// * `key_pattern` - key 模式，空字符串或 `*` 匹配全部，否则按等值或正则匹配
    /// * `handler` - 变更处理函数
    fn subscribe(&self, key_pattern: &str, handler: ChangeHandler);

    /// 当前所有配置项的副本
    fn snapshot(&self) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        self.each(&mut |key, value| {
            properties.insert(key.to_string(), value.to_string());
            ControlFlow::Continue(())
        });
        properties
    }
}

impl fmt::Debug for dyn PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySource")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// 基于内存表的可变配置源
///
/// 写操作同步更新内存表，变更事件交由后台线程按顺序通知监听器。
#[derive(Debug)]
pub struct MapPropertySource {
    name: String,
    properties: RwLock<HashMap<String, String>>,
    dispatcher: EventDispatcher,
}

impl MapPropertySource {
    /// 创建配置源
    ///
    /// # 参数
    /// * `name` - 配置源名称
    /// * `properties` - 初始配置
    pub fn new(name: impl Into<String>, properties: HashMap<String, String>) -> Self {
        let name = name.into();
        let dispatcher = EventDispatcher::new(name.clone(), Arc::new(ListenerRegistry::new()));
        Self {
            name,
            properties: RwLock::new(properties),
            dispatcher,
        }
    }

    /// 创建空的配置源
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, HashMap::new())
    }

    /// 配置项数量
    pub fn len(&self) -> usize {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 是否没有任何配置项
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 写入配置，触发 `Add` 或 `Update` 事件
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        let old = self
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.clone());

        let event = match old {
            Some(old) => KeyChangeEvent::updated(key, old, value),
            None => KeyChangeEvent::added(key, value),
        };
        self.dispatcher.dispatch(event);
    }

    /// 批量写入配置，每个 key 各触发一次事件
    pub fn put_all<I, K, V>(&self, properties: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in properties {
            self.put(key, value);
        }
    }

    /// 删除配置，只对实际存在的 key 触发 `Delete` 事件
    pub fn remove<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            let key = key.as_ref();
            let old = self
                .properties
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key);

            if let Some(old) = old {
                self.dispatcher.dispatch(KeyChangeEvent::deleted(key, old));
            }
        }
    }
}

impl PropertySource for MapPropertySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_property(&self, key: &str) -> Option<String> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn each(&self, visit: &mut dyn FnMut(&str, &str) -> ControlFlow<()>) {
        let snapshot = self
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (key, value) in &snapshot {
            if visit(key, value).is_break() {
                break;
            }
        }
    }

    fn subscribe(&self, key_pattern: &str, handler: ChangeHandler) {
        self.dispatcher.registry().subscribe(key_pattern, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::event::ChangeType;
    use std::sync::mpsc;
    use std::time::Duration;

    fn source() -> MapPropertySource {
        MapPropertySource::new(
            "test",
            HashMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]),
        )
    }

    #[test]
    fn test_lookup_and_default() {
        let source = source();
        assert_eq!(source.get_property("a"), Some("1".to_string()));
        assert_eq!(source.get_property("missing"), None);
        assert_eq!(source.get_property_or("missing", "def"), "def");
        assert!(source.contains_property("b"));
    }

    #[test]
    fn test_each_stops_early() {
        let source = source();
        let mut visited = 0;
        source.each(&mut |_, _| {
            visited += 1;
            ControlFlow::Break(())
        });
        assert_eq!(visited, 1);
        assert_eq!(source.snapshot().len(), 2);
    }

    #[test]
    fn test_mutations_fire_events_in_order() {
        let source = source();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        source.subscribe(
            "*",
            Arc::new(move |event: &KeyChangeEvent| {
                let _ = tx.lock().unwrap().send(event.clone());
            }),
        );

        source.put("a", "10");
        source.put("c", "3");
        source.remove(["b", "not-there"]);

        let timeout = Duration::from_secs(2);
        let first = rx.recv_timeout(timeout).unwrap();
        assert_eq!(first, KeyChangeEvent::updated("a", "1", "10"));
        let second = rx.recv_timeout(timeout).unwrap();
        assert_eq!(second.change_type, ChangeType::Add);
        assert_eq!(second.key, "c");
        let third = rx.recv_timeout(timeout).unwrap();
        assert_eq!(third, KeyChangeEvent::deleted("b", "2"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        assert_eq!(source.get_property("a"), Some("10".to_string()));
        assert_eq!(source.get_property("b"), None);
    }
}
