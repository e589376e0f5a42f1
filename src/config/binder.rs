//! 配置绑定模块
//!
//! 按字段描述表把配置绑定到结构体上，并可选地订阅配置变更，在配置变化时重新赋值对应字段。
//!
//! 字段的配置 key 为 `前缀 + 子key`，未指定子 key 时使用小写的字段名。嵌套结构体以
//! `前缀 + 子key + "."` 作为新前缀递归绑定；map 字段枚举该前缀下的所有 key，
//! 按下一段 key 分组后为每组绑定一个元素。
//!
//! ```ignore
//! #[derive(Default)]
//! struct User {
//!     id: i64,
//!     username: String,
//!     timeout: u32,
//! }
//!
//! impl Bindable for User {
//!     fn describe(fields: &mut FieldTable<Self>) {
//!         fields.value("id", |u| &mut u.id);
//!         fields.value("username", |u| &mut u.username);
//!         fields.value("timeout", |u| &mut u.timeout).default("30");
//!     }
//! }
//! ```

use crate::config::convert::{FromProperty, MapKey};
use crate::config::event::{ChangeHandler, KeyChangeEvent};
use crate::config::resolver::PropertyResolver;
use crate::error::{BindError, FieldError};
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, Weak};
use tracing::{debug, error, info};

/// 绑定所需的配置环境能力
pub trait BindContext: PropertyResolver {
    /// 合并后的所有配置 key
    fn property_keys(&self) -> Vec<String>;

    /// 订阅所有配置源的配置变更
    fn subscribe(&self, key_pattern: &str, handler: ChangeHandler);
}

/// 可绑定配置的结构体
pub trait Bindable: Default + Send + Sync + 'static {
    /// 描述需要绑定的字段
    fn describe(fields: &mut FieldTable<Self>);
}

/// 对目标值执行一次修改，目标已被释放时不做任何事
type Access<T> = Arc<dyn Fn(&mut dyn FnMut(&mut T)) + Send + Sync>;

fn root_access<T: Send + Sync + 'static>(root: &Arc<RwLock<T>>) -> Access<T> {
    let weak: Weak<RwLock<T>> = Arc::downgrade(root);
    Arc::new(move |apply: &mut dyn FnMut(&mut T)| {
        if let Some(root) = weak.upgrade() {
            let mut guard = root.write().unwrap_or_else(PoisonError::into_inner);
            apply(&mut *guard);
        }
    })
}

fn child_access<T, C>(parent: &Access<T>, accessor: fn(&mut T) -> &mut C) -> Access<C>
where
    T: 'static,
    C: 'static,
{
    let parent = Arc::clone(parent);
    Arc::new(move |apply: &mut dyn FnMut(&mut C)| {
        parent(&mut |owner: &mut T| apply(accessor(owner)));
    })
}

/// 去掉模块路径的类型名称
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// 字段元信息
#[derive(Debug, Clone)]
struct FieldMeta {
    owner: &'static str,
    name: &'static str,
    key: Option<String>,
    sub_key: Option<String>,
    default: Option<String>,
}

impl FieldMeta {
    fn config_key(&self, prefix: &str) -> String {
        let sub_key = self
            .key
            .clone()
            .or_else(|| self.sub_key.clone())
            .unwrap_or_else(|| self.name.to_lowercase());
        format!("{prefix}{sub_key}")
    }
}

/// 字段描述
pub struct FieldSpec<T> {
    meta: FieldMeta,
    binder: Box<dyn FieldBinder<T>>,
}

impl<T> FieldSpec<T> {
    /// 指定子 key，优先于 [`sub_key`](Self::sub_key)
    pub fn key(&mut self, key: impl Into<String>) -> &mut Self {
        self.meta.key = Some(key.into());
        self
    }

    /// 指定子 key 的另一种写法
    pub fn sub_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.meta.sub_key = Some(key.into());
        self
    }

    /// 配置不存在时使用的默认值，默认值中的占位符同样会被替换
    pub fn default(&mut self, value: impl Into<String>) -> &mut Self {
        self.meta.default = Some(value.into());
        self
    }

    /// 字段名称
    pub fn name(&self) -> &'static str {
        self.meta.name
    }
}

impl<T> fmt::Debug for FieldSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// 结构体的字段描述表
pub struct FieldTable<T> {
    owner: &'static str,
    fields: Vec<FieldSpec<T>>,
}

impl<T: Bindable> FieldTable<T> {
    fn describe() -> Self {
        let mut table = Self {
            owner: short_type_name::<T>(),
            fields: Vec::new(),
        };
        T::describe(&mut table);
        table
    }

    fn push(&mut self, name: &'static str, binder: Box<dyn FieldBinder<T>>) -> &mut FieldSpec<T> {
        self.fields.push(FieldSpec {
            meta: FieldMeta {
                owner: self.owner,
                name,
                key: None,
                sub_key: None,
                default: None,
            },
            binder,
        });
        let last = self.fields.len() - 1;
        &mut self.fields[last]
    }

    /// 标量字段
    pub fn value<F>(&mut self, name: &'static str, accessor: fn(&mut T) -> &mut F) -> &mut FieldSpec<T>
    where
        F: FromProperty + Send + Sync + 'static,
    {
        self.push(name, Box::new(ValueField { accessor }))
    }

    /// 嵌套结构体字段，以该字段的 key 作为前缀展开绑定
    pub fn nested<C>(&mut self, name: &'static str, accessor: fn(&mut T) -> &mut C) -> &mut FieldSpec<T>
    where
        C: Bindable,
    {
        self.push(name, Box::new(NestedField { accessor }))
    }

    /// 可选的嵌套结构体字段，绑定时为 `None` 的字段先以默认值填充
    pub fn nested_opt<C>(
        &mut self,
        name: &'static str,
        accessor: fn(&mut T) -> &mut Option<C>,
    ) -> &mut FieldSpec<T>
    where
        C: Bindable,
    {
        self.push(name, Box::new(OptionalNestedField { accessor }))
    }

    /// 元素为结构体的 map 字段，map key 取前缀后的下一段 key
    pub fn map<K, C>(
        &mut self,
        name: &'static str,
        accessor: fn(&mut T) -> &mut HashMap<K, C>,
    ) -> &mut FieldSpec<T>
    where
        K: MapKey,
        C: Bindable,
    {
        self.push(
            name,
            Box::new(MapField {
                accessor,
                entries: PhantomData::<fn() -> StructEntries<C>>,
            }),
        )
    }

    /// 元素为标量的 map 字段，map key 取前缀后的剩余部分
    pub fn map_values<K, V>(
        &mut self,
        name: &'static str,
        accessor: fn(&mut T) -> &mut HashMap<K, V>,
    ) -> &mut FieldSpec<T>
    where
        K: MapKey,
        V: FromProperty + Send + Sync + 'static,
    {
        self.push(
            name,
            Box::new(MapField {
                accessor,
                entries: PhantomData::<fn() -> ScalarEntries<V>>,
            }),
        )
    }
}

impl<T> FieldTable<T> {
    /// 字段名称列表
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.meta.name).collect()
    }
}

/// 单次绑定过程的状态
struct BindRun {
    context: Arc<dyn BindContext>,
    live: bool,
    first_error: RefCell<Option<FieldError>>,
    stack: RefCell<Vec<TypeId>>,
}

impl BindRun {
    fn new(context: Arc<dyn BindContext>, live: bool) -> Self {
        Self {
            context,
            live,
            first_error: RefCell::new(None),
            stack: RefCell::new(Vec::new()),
        }
    }

    /// 非监听的子过程，继承当前的嵌套类型栈
    fn detached(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            live: false,
            first_error: RefCell::new(None),
            stack: RefCell::new(self.stack.borrow().clone()),
        }
    }

    fn record(&self, err: FieldError) {
        error!("{}", err);
        let mut first = self.first_error.borrow_mut();
        if first.is_none() {
            *first = Some(err);
        }
    }

    fn bind_struct<T: Bindable>(&self, prefix: &str, access: &Access<T>) -> Result<(), BindError> {
        self.stack.borrow_mut().push(TypeId::of::<T>());
        let table = FieldTable::<T>::describe();
        let result = table
            .fields
            .iter()
            .try_for_each(|spec| spec.binder.bind(&spec.meta, self, prefix, access));
        self.stack.borrow_mut().pop();
        result
    }

    fn check_nesting<C: 'static>(&self, meta: &FieldMeta) -> Result<(), BindError> {
        if self.stack.borrow().contains(&TypeId::of::<C>()) {
            return Err(BindError::CyclicNesting {
                owner: meta.owner,
                field: meta.name.to_string(),
            });
        }
        Ok(())
    }
}

/// 类型擦除后的字段绑定逻辑
trait FieldBinder<T>: Send + Sync {
    fn bind(
        &self,
        meta: &FieldMeta,
        run: &BindRun,
        prefix: &str,
        access: &Access<T>,
    ) -> Result<(), BindError>;
}

/// 解析字段当前应取的值：配置存在取配置值，否则取替换占位符后的默认值
fn resolve_value(
    context: &dyn BindContext,
    key: &str,
    default: Option<&str>,
) -> Result<Option<String>, BindError> {
    if let Some(value) = context.get_property(key)? {
        return Ok(Some(value));
    }
    match default {
        Some(default) => Ok(Some(context.resolve_nested_placeholders(default)?)),
        None => Ok(None),
    }
}

fn convert_field<F: FromProperty>(meta: &FieldMeta, value: &str) -> Result<F, FieldError> {
    F::from_property(value).map_err(|source| FieldError {
        owner: meta.owner,
        field: meta.name.to_string(),
        declared_type: F::type_name(),
        value: value.to_string(),
        source,
    })
}

fn assign<T, F>(access: &Access<T>, accessor: fn(&mut T) -> &mut F, value: F) {
    let mut slot = Some(value);
    access(&mut |target: &mut T| {
        if let Some(value) = slot.take() {
            *accessor(target) = value;
        }
    });
}

fn exact_pattern(key: &str) -> String {
    format!("^{}$", regex::escape(key))
}

fn prefix_pattern(prefix: &str) -> String {
    format!("^{}.*", regex::escape(prefix))
}

struct ValueField<T, F> {
    accessor: fn(&mut T) -> &mut F,
}

impl<T, F> FieldBinder<T> for ValueField<T, F>
where
    T: Send + Sync + 'static,
    F: FromProperty + Send + Sync + 'static,
{
    fn bind(
        &self,
        meta: &FieldMeta,
        run: &BindRun,
        prefix: &str,
        access: &Access<T>,
    ) -> Result<(), BindError> {
        let key = meta.config_key(prefix);
        let value = resolve_value(run.context.as_ref(), &key, meta.default.as_deref())?;
        if let Some(value) = value {
            match convert_field::<F>(meta, &value) {
                Ok(converted) => assign(access, self.accessor, converted),
                Err(err) => run.record(err),
            }
        }

        if run.live {
            let context = Arc::downgrade(&run.context);
            let access = Arc::clone(access);
            let accessor = self.accessor;
            let meta = meta.clone();
            let field_key = key.clone();
            run.context.subscribe(
                &exact_pattern(&key),
                Arc::new(move |event: &KeyChangeEvent| {
                    let Some(context) = context.upgrade() else {
                        return;
                    };
                    debug!("配置[{}]变更，重新绑定字段[{}.{}]: {}", field_key, meta.owner, meta.name, event);
                    let value = match resolve_value(context.as_ref(), &field_key, meta.default.as_deref()) {
                        Ok(value) => value.unwrap_or_default(),
                        Err(err) => {
                            error!("重新绑定字段[{}.{}]失败: {}", meta.owner, meta.name, err);
                            return;
                        }
                    };
                    match convert_field::<F>(&meta, &value) {
                        Ok(converted) => assign(&access, accessor, converted),
                        Err(err) => error!("{}", err),
                    }
                }),
            );
        }
        Ok(())
    }
}

struct NestedField<T, C> {
    accessor: fn(&mut T) -> &mut C,
}

impl<T, C> FieldBinder<T> for NestedField<T, C>
where
    T: Send + Sync + 'static,
    C: Bindable,
{
    fn bind(
        &self,
        meta: &FieldMeta,
        run: &BindRun,
        prefix: &str,
        access: &Access<T>,
    ) -> Result<(), BindError> {
        run.check_nesting::<C>(meta)?;
        let child = child_access(access, self.accessor);
        run.bind_struct::<C>(&format!("{}.", meta.config_key(prefix)), &child)
    }
}

struct OptionalNestedField<T, C> {
    accessor: fn(&mut T) -> &mut Option<C>,
}

impl<T, C> FieldBinder<T> for OptionalNestedField<T, C>
where
    T: Send + Sync + 'static,
    C: Bindable,
{
    fn bind(
        &self,
        meta: &FieldMeta,
        run: &BindRun,
        prefix: &str,
        access: &Access<T>,
    ) -> Result<(), BindError> {
        run.check_nesting::<C>(meta)?;
        let accessor = self.accessor;
        let parent = Arc::clone(access);
        let child: Access<C> = Arc::new(move |apply: &mut dyn FnMut(&mut C)| {
            parent(&mut |owner: &mut T| apply(accessor(owner).get_or_insert_with(C::default)));
        });
        run.bind_struct::<C>(&format!("{}.", meta.config_key(prefix)), &child)
    }
}

/// map 元素的构造方式
trait MapEntries: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    /// 从配置 key 中截取 map key 部分，不属于任何元素时返回 `None`
    fn entry_key(rest: &str) -> Option<&str>;

    /// 元素类型与当前绑定链上的类型相同时返回循环嵌套错误
    fn check_nesting(_meta: &FieldMeta, _run: &BindRun) -> Result<(), BindError> {
        Ok(())
    }

    fn build(
        meta: &FieldMeta,
        run: &BindRun,
        entry_prefix: &str,
    ) -> Result<Option<Self::Value>, BindError>;
}

struct StructEntries<C>(PhantomData<C>);

impl<C: Bindable> MapEntries for StructEntries<C> {
    type Value = C;

    fn entry_key(rest: &str) -> Option<&str> {
        rest.split_once('.')
            .map(|(key, _)| key)
            .filter(|key| !key.is_empty())
    }

    fn check_nesting(meta: &FieldMeta, run: &BindRun) -> Result<(), BindError> {
        run.check_nesting::<C>(meta)
    }

    fn build(_meta: &FieldMeta, run: &BindRun, entry_prefix: &str) -> Result<Option<C>, BindError> {
        let entry = Arc::new(RwLock::new(C::default()));
        run.bind_struct::<C>(&format!("{entry_prefix}."), &root_access(&entry))?;
        let value = Arc::try_unwrap(entry)
            .map(|lock| lock.into_inner().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default();
        Ok(Some(value))
    }
}

struct ScalarEntries<V>(PhantomData<V>);

impl<V> MapEntries for ScalarEntries<V>
where
    V: FromProperty + Send + Sync + 'static,
{
    type Value = V;

    fn entry_key(rest: &str) -> Option<&str> {
        Some(rest).filter(|key| !key.is_empty())
    }

    fn build(meta: &FieldMeta, run: &BindRun, full_key: &str) -> Result<Option<V>, BindError> {
        let Some(value) = run.context.get_property(full_key)? else {
            return Ok(None);
        };
        match convert_field::<V>(meta, &value) {
            Ok(converted) => Ok(Some(converted)),
            Err(err) => {
                run.record(err);
                Ok(None)
            }
        }
    }
}

struct MapField<T, K, E: MapEntries> {
    accessor: fn(&mut T) -> &mut HashMap<K, E::Value>,
    entries: PhantomData<fn() -> E>,
}

impl<T, K, E> MapField<T, K, E>
where
    K: MapKey,
    E: MapEntries,
{
    fn build_map(meta: &FieldMeta, run: &BindRun, map_prefix: &str) -> Result<HashMap<K, E::Value>, BindError> {
        let entry_keys: BTreeSet<String> = run
            .context
            .property_keys()
            .iter()
            .filter_map(|key| key.strip_prefix(map_prefix))
            .filter_map(E::entry_key)
            .map(str::to_string)
            .collect();

        let mut map = HashMap::with_capacity(entry_keys.len());
        for entry_key in entry_keys {
            let key = match convert_field::<K>(meta, &entry_key) {
                Ok(key) => key,
                Err(err) => {
                    run.record(err);
                    continue;
                }
            };
            if let Some(value) = E::build(meta, run, &format!("{map_prefix}{entry_key}"))? {
                map.insert(key, value);
            }
        }
        Ok(map)
    }
}

impl<T, K, E> FieldBinder<T> for MapField<T, K, E>
where
    T: Send + Sync + 'static,
    K: MapKey,
    E: MapEntries,
{
    fn bind(
        &self,
        meta: &FieldMeta,
        run: &BindRun,
        prefix: &str,
        access: &Access<T>,
    ) -> Result<(), BindError> {
        E::check_nesting(meta, run)?;
        let map_prefix = format!("{}.", meta.config_key(prefix));
        let entries_run = run.detached();
        let map = Self::build_map(meta, &entries_run, &map_prefix);
        if let Some(err) = entries_run.first_error.into_inner() {
            run.record(err);
        }
        assign(access, self.accessor, map?);

        if run.live {
            let context = Arc::downgrade(&run.context);
            let access = Arc::clone(access);
            let accessor = self.accessor;
            let meta = meta.clone();
            let pattern = prefix_pattern(&map_prefix);
            run.context.subscribe(
                &pattern,
                Arc::new(move |event: &KeyChangeEvent| {
                    let Some(context) = context.upgrade() else {
                        return;
                    };
                    debug!("配置[{}]变更，重建map字段[{}.{}]", event.key, meta.owner, meta.name);
                    let rebuild_run = BindRun::new(context, false);
                    match Self::build_map(&meta, &rebuild_run, &map_prefix) {
                        Ok(map) => assign(&access, accessor, map),
                        Err(err) => error!("重建map字段[{}.{}]失败: {}", meta.owner, meta.name, err),
                    }
                }),
            );
        }
        Ok(())
    }
}

/// 绑定结果，持有绑定后的结构体
///
/// 开启变更监听时，结构体字段会在配置变化后被更新，通过 [`read`](Self::read) 或
/// [`get`](Self::get) 读取最新值。
pub struct Bound<T> {
    inner: Arc<RwLock<T>>,
    first_error: Option<FieldError>,
}

impl<T> Clone for Bound<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            first_error: self.first_error.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Bound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound")
            .field("value", &*self.read())
            .field("first_error", &self.first_error)
            .finish()
    }
}

impl<T> Bound<T> {
    /// 读锁访问
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 在读锁内执行闭包
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.read())
    }

    /// 绑定过程中遇到的第一个字段转换错误
    pub fn first_error(&self) -> Option<&FieldError> {
        self.first_error.as_ref()
    }

    /// 要求绑定过程没有字段转换错误
    ///
    /// # 返回
    /// * `Result<(), BindError>` - 存在转换错误时返回第一个错误
    pub fn ensure_valid(&self) -> Result<(), BindError> {
        match &self.first_error {
            Some(err) => Err(BindError::Field(err.clone())),
            None => Ok(()),
        }
    }

    /// 共享的结构体
    pub fn shared(&self) -> Arc<RwLock<T>> {
        Arc::clone(&self.inner)
    }
}

impl<T: Clone> Bound<T> {
    /// 当前值的副本
    pub fn get(&self) -> T {
        self.read().clone()
    }
}

/// 规范化 key 前缀，非空前缀以 `.` 结尾
fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim();
    if prefix.is_empty() || prefix.ends_with('.') {
        prefix.to_string()
    } else {
        format!("{prefix}.")
    }
}

/// 将配置绑定到结构体
///
/// # 参数
/// * `context` - 配置环境
/// * `prefix` - key 前缀，如 `user` 或 `user.`
/// * `target` - 绑定目标，已有的字段值在配置与默认值都不存在时保持不变
/// * `live` - 是否订阅配置变更并自动更新字段
///
/// # 返回
/// * `Result<Bound<T>, BindError>` - 循环嵌套与解析错误导致绑定失败；
///   单个字段的转换错误只记录日志，第一个错误可通过 [`Bound::first_error`] 获取
pub fn bind_properties<T: Bindable>(
    context: Arc<dyn BindContext>,
    prefix: &str,
    target: T,
    live: bool,
) -> Result<Bound<T>, BindError> {
    let prefix = normalize_prefix(prefix);
    let inner = Arc::new(RwLock::new(target));
    let run = BindRun::new(context, live);

    run.bind_struct::<T>(&prefix, &root_access(&inner))?;

    info!(
        "绑定配置[{}]完成, 前缀:[{}], 变更监听:[{}]",
        short_type_name::<T>(),
        prefix,
        live
    );
    Ok(Bound {
        inner,
        first_error: run.first_error.into_inner(),
    })
}
