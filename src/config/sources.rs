//! 配置源集合模块
//!
//! 有序的配置源列表，越靠前优先级越高。读操作遍历当前快照，
//! 写操作基于快照构造新列表后原子替换，并发读取不会看到中间状态。

use crate::config::event::panic_message;
use crate::config::source::PropertySource;
use crate::error::SourceError;
use arc_swap::ArcSwap;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// 配置源列表快照
pub type SourceList = Vec<Arc<dyn PropertySource>>;

/// 配置源集合变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourcesChangeType {
    /// 新增配置源
    Add,
    /// 替换配置源
    Update,
    /// 移除配置源
    Remove,
}

impl fmt::Display for SourcesChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourcesChangeType::Add => write!(f, "ADD"),
            SourcesChangeType::Update => write!(f, "UPDATE"),
            SourcesChangeType::Remove => write!(f, "REMOVE"),
        }
    }
}

/// 配置源集合变更监听器
pub type SourcesListener =
    Arc<dyn Fn(&PropertySources, SourcesChangeType, &Arc<dyn PropertySource>) + Send + Sync>;

/// 有序配置源集合
pub struct PropertySources {
    list: ArcSwap<SourceList>,
    write_lock: Mutex<()>,
    listeners: RwLock<Vec<SourcesListener>>,
}

impl Default for PropertySources {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertySources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySources")
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}

impl PropertySources {
    /// 创建空集合
    pub fn new() -> Self {
        Self::with_sources(Vec::new())
    }

    /// 以给定顺序创建集合，重名的配置源只保留第一个
    pub fn with_sources(sources: SourceList) -> Self {
        let mut list: SourceList = Vec::with_capacity(sources.len());
        for source in sources {
            if !list.iter().any(|s| s.name() == source.name()) {
                list.push(source);
            }
        }
        Self {
            list: ArcSwap::from_pointee(list),
            write_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 订阅集合变更，监听器在发起变更的线程中同步执行
    pub fn subscribe(&self, listener: SourcesListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// 当前配置源列表的快照
    pub fn snapshot(&self) -> Arc<SourceList> {
        self.list.load_full()
    }

    /// 配置源数量
    pub fn size(&self) -> usize {
        self.list.load().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 按优先级从高到低的配置源名称
    pub fn names(&self) -> Vec<String> {
        self.list
            .load()
            .iter()
            .map(|source| source.name().to_string())
            .collect()
    }

    /// 是否包含指定名称的配置源
    pub fn contains(&self, name: &str) -> bool {
        self.list.load().iter().any(|source| source.name() == name)
    }

    /// 获取指定名称的配置源
    pub fn get(&self, name: &str) -> Option<Arc<dyn PropertySource>> {
        self.list
            .load()
            .iter()
            .find(|source| source.name() == name)
            .cloned()
    }

    /// 从最高优先级开始遍历，访问函数返回 `ControlFlow::Break` 时停止
    pub fn each<F>(&self, mut visit: F)
    where
        F: FnMut(usize, &Arc<dyn PropertySource>) -> ControlFlow<()>,
    {
        let list = self.snapshot();
        for (index, source) in list.iter().enumerate() {
            if visit(index, source).is_break() {
                return;
            }
        }
    }

    /// 从最低优先级开始反向遍历
    pub fn each_revert<F>(&self, mut visit: F)
    where
        F: FnMut(usize, &Arc<dyn PropertySource>) -> ControlFlow<()>,
    {
        let list = self.snapshot();
        for (index, source) in list.iter().enumerate().rev() {
            if visit(index, source).is_break() {
                return;
            }
        }
    }

    /// 添加为最高优先级，同名配置源先被移除
    pub fn add_first(&self, source: Arc<dyn PropertySource>) {
        debug!(
            "Adding PropertySource '{}' with highest search precedence",
            source.name()
        );
        self.mutate(|list| {
            let mut next = without(list, source.name());
            next.insert(0, Arc::clone(&source));
            next
        });
        self.fire(SourcesChangeType::Add, &source);
    }

    /// 添加为最低优先级，同名配置源先被移除
    pub fn add_last(&self, source: Arc<dyn PropertySource>) {
        debug!(
            "Adding PropertySource '{}' with lowest search precedence",
            source.name()
        );
        self.mutate(|list| {
            let mut next = without(list, source.name());
            next.push(Arc::clone(&source));
            next
        });
        self.fire(SourcesChangeType::Add, &source);
    }

    /// 插入到指定配置源之前（优先级紧邻其上）
    ///
    /// # 返回
    /// * `Result<(), SourceError>` - 参照配置源不存在或与新配置源同名时返回错误，集合保持不变
    pub fn add_before(
        &self,
        relative_name: &str,
        source: Arc<dyn PropertySource>,
    ) -> Result<(), SourceError> {
        debug!(
            "Adding PropertySource '{}' with search precedence immediately higher than '{}'",
            source.name(),
            relative_name
        );
        self.insert_relative(relative_name, source, 0)
    }

    /// 插入到指定配置源之后（优先级紧邻其下）
    pub fn add_after(
        &self,
        relative_name: &str,
        source: Arc<dyn PropertySource>,
    ) -> Result<(), SourceError> {
        debug!(
            "Adding PropertySource '{}' with search precedence immediately lower than '{}'",
            source.name(),
            relative_name
        );
        self.insert_relative(relative_name, source, 1)
    }

    fn insert_relative(
        &self,
        relative_name: &str,
        source: Arc<dyn PropertySource>,
        offset: usize,
    ) -> Result<(), SourceError> {
        if relative_name == source.name() {
            return Err(SourceError::SelfReference {
                name: relative_name.to_string(),
            });
        }

        self.try_mutate(|list| {
            let mut next = without(list, source.name());
            let index = index_of(&next, relative_name)?;
            next.insert(index + offset, Arc::clone(&source));
            Ok(next)
        })?;
        self.fire(SourcesChangeType::Add, &source);
        Ok(())
    }

    /// 替换指定名称的配置源
    ///
    /// 新配置源占据被替换者的位置，其他同名配置源被移除。
    pub fn replace(&self, name: &str, source: Arc<dyn PropertySource>) -> Result<(), SourceError> {
        debug!("Replacing PropertySource '{}' with '{}'", name, source.name());

        self.try_mutate(|list| {
            let index = index_of(list, name)?;
            let next = list
                .iter()
                .enumerate()
                .filter_map(|(i, item)| {
                    if i == index {
                        Some(Arc::clone(&source))
                    } else if item.name() == source.name() {
                        None
                    } else {
                        Some(Arc::clone(item))
                    }
                })
                .collect();
            Ok(next)
        })?;
        self.fire(SourcesChangeType::Update, &source);
        Ok(())
    }

    /// 移除指定名称的配置源
    pub fn remove(&self, name: &str) -> Option<Arc<dyn PropertySource>> {
        debug!("Removing PropertySource '{}'", name);

        let mut removed = None;
        let result = self.try_mutate(|list| {
            let index = index_of(list, name)?;
            removed = Some(Arc::clone(&list[index]));
            Ok(without(list, name))
        });

        match (result, removed) {
            (Ok(()), Some(source)) => {
                self.fire(SourcesChangeType::Remove, &source);
                Some(source)
            }
            _ => None,
        }
    }

    fn mutate<F>(&self, build: F)
    where
        F: FnOnce(&SourceList) -> SourceList,
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = build(&self.list.load_full());
        self.list.store(Arc::new(next));
    }

    /// 在写锁内基于当前快照构造新列表并原子替换，构造失败时集合保持不变
    fn try_mutate<F>(&self, build: F) -> Result<(), SourceError>
    where
        F: FnOnce(&SourceList) -> Result<SourceList, SourceError>,
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.list.load_full();
        let next = build(&current)?;
        self.list.store(Arc::new(next));
        Ok(())
    }

    fn fire(&self, change_type: SourcesChangeType, source: &Arc<dyn PropertySource>) {
        let listeners: Vec<SourcesListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| listener(self, change_type, source)));
            if let Err(panic) = result {
                warn!(
                    "配置源集合监听器处理[{}][{}]发生panic: {}",
                    change_type,
                    source.name(),
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn without(list: &SourceList, name: &str) -> SourceList {
    list.iter()
        .filter(|source| source.name() != name)
        .cloned()
        .collect()
}

fn index_of(list: &SourceList, name: &str) -> Result<usize, SourceError> {
    list.iter()
        .position(|source| source.name() == name)
        .ok_or_else(|| SourceError::NotFound {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source::MapPropertySource;
    use std::collections::HashMap;

    fn named(name: &str) -> Arc<dyn PropertySource> {
        Arc::new(MapPropertySource::new(
            name,
            HashMap::from([("origin".to_string(), name.to_string())]),
        ))
    }

    fn abc() -> PropertySources {
        let sources = PropertySources::new();
        sources.add_last(named("A"));
        sources.add_last(named("B"));
        sources.add_last(named("C"));
        sources
    }

    #[test]
    fn test_relative_insertion_order() {
        let sources = abc();
        sources.add_before("B", named("D")).unwrap();
        assert_eq!(sources.names(), vec!["A", "D", "B", "C"]);

        sources.add_after("B", named("E")).unwrap();
        assert_eq!(sources.names(), vec!["A", "D", "B", "E", "C"]);

        sources.add_after("C", named("F")).unwrap();
        assert_eq!(sources.names(), vec!["A", "D", "B", "E", "C", "F"]);
    }

    #[test]
    fn test_add_replaces_same_name_without_duplicates() {
        let sources = abc();
        sources.add_first(named("C"));
        assert_eq!(sources.names(), vec!["C", "A", "B"]);

        sources.add_last(named("A"));
        assert_eq!(sources.names(), vec!["C", "B", "A"]);
        assert_eq!(sources.size(), 3);
    }

    #[test]
    fn test_relative_insertion_errors_leave_collection_unchanged() {
        let sources = abc();

        let err = sources.add_before("X", named("A")).unwrap_err();
        assert_eq!(err, SourceError::NotFound { name: "X".into() });
        assert_eq!(sources.names(), vec!["A", "B", "C"]);

        let err = sources.add_after("B", named("B")).unwrap_err();
        assert_eq!(err, SourceError::SelfReference { name: "B".into() });
        assert_eq!(
            err.to_string(),
            "PropertySource named 'B' cannot be added relative to itself"
        );
        assert_eq!(sources.names(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_replace() {
        let sources = abc();
        sources.replace("B", named("Z")).unwrap();
        assert_eq!(sources.names(), vec!["A", "Z", "C"]);

        sources.replace("Z", named("A")).unwrap();
        assert_eq!(sources.names(), vec!["A", "C"]);

        assert_eq!(
            sources.replace("missing", named("Q")).unwrap_err(),
            SourceError::NotFound {
                name: "missing".into()
            }
        );
    }

    #[test]
    fn test_each_and_each_revert_stop_early() {
        let sources = abc();
        let mut forward = Vec::new();
        sources.each(|index, source| {
            forward.push((index, source.name().to_string()));
            if index == 1 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(forward, vec![(0, "A".to_string()), (1, "B".to_string())]);

        let mut backward = Vec::new();
        sources.each_revert(|index, _| {
            backward.push(index);
            ControlFlow::Continue(())
        });
        assert_eq!(backward, vec![2, 1, 0]);
    }

    #[test]
    fn test_listeners_are_isolated_and_synchronous() {
        let sources = PropertySources::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        sources.subscribe(Arc::new(|_, _, _| panic!("broken listener")));
        let sink = Arc::clone(&seen);
        sources.subscribe(Arc::new(move |all, change_type, source| {
            sink.lock()
                .unwrap()
                .push((change_type, source.name().to_string(), all.size()));
        }));

        sources.add_first(named("A"));
        sources.add_last(named("B"));
        sources.replace("B", named("C")).unwrap();
        sources.remove("A");
        assert!(sources.add_before("missing", named("D")).is_err());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SourcesChangeType::Add, "A".to_string(), 1),
                (SourcesChangeType::Add, "B".to_string(), 2),
                (SourcesChangeType::Update, "C".to_string(), 2),
                (SourcesChangeType::Remove, "A".to_string(), 1),
            ]
        );
        assert_eq!(sources.names(), vec!["C"]);
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let sources = abc();
        let snapshot = sources.snapshot();
        sources.add_first(named("Z"));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(sources.size(), 4);
        assert!(sources.get("Z").is_some());
        assert!(!sources.contains("missing"));
    }
}
