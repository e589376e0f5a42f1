//! 配置环境模块
//!
//! 按固定优先级组装配置源，并在其上提供配置读取、profile 激活、配置变更订阅与结构体绑定。
//!
//! 组装后的优先级（从高到低）：
//! 1. 命令行参数 `commandLineEnvironment`
//! 2. 运行信息 `runInfoEnvironment`
//! 3. 默认配置文件 `defaultApplicationEnvironment`
//! 4. profile 配置文件 `application-<profile>.<ext>`，后激活的优先
//! 5. 附加配置源
//! 6. 系统环境变量 `systemEnvironment`

use crate::config::binder::{bind_properties, BindContext, Bindable, Bound};
use crate::config::command_line::command_line_source;
use crate::config::convert::FromProperty;
use crate::config::event::{ChangeHandler, KeyChangeEvent, ListenerRegistry};
use crate::config::loader::PropertiesLoaders;
use crate::config::resolver::{PropertyResolver, PropertySourcesPropertyResolver};
use crate::config::run_info::{DetectContext, Detector, DetectorChain, Env, EnvAliases, RunInfo};
use crate::config::source::{MapPropertySource, PropertySource};
use crate::config::sources::{PropertySources, SourcesChangeType};
use crate::config::system::{system_environment_source, SYSTEM_ENVIRONMENT_SOURCE_NAME};
use crate::error::{BindError, EnvError, ResolveError};
use regex::Regex;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

/// 运行信息配置源名称
pub const RUN_INFO_SOURCE_NAME: &str = "runInfoEnvironment";
/// 默认配置文件配置源名称
pub const DEFAULT_APPLICATION_SOURCE_NAME: &str = "defaultApplicationEnvironment";
/// 声明需要激活的 profile 的配置 key
pub const PROFILE_INCLUDE_KEY: &str = "envkit.profile.include";
/// 默认配置目录
pub const DEFAULT_CONFIG_DIR: &str = "./config";

/// 配置环境
pub trait Environment: PropertyResolver {
    /// 配置源集合
    fn property_sources(&self) -> &Arc<PropertySources>;

    /// 已激活的 profile
    fn active_profiles(&self) -> Vec<String>;

    /// 当前运行信息
    fn run_info(&self) -> &RunInfo;

    /// 订阅任意配置源的配置变更
    fn subscribe(&self, key_pattern: &str, handler: ChangeHandler);
}

/// 配置环境构建器
pub struct EnvironmentBuilder {
    config_dirs: HashMap<Env, PathBuf>,
    additional_sources: Vec<Arc<dyn PropertySource>>,
    ignore_unresolvable_nested: bool,
    detectors: DetectorChain,
    aliases: EnvAliases,
    append_command_line: String,
    include_profiles: Vec<String>,
    args: Option<Vec<String>>,
    loaders: PropertiesLoaders,
    system_environment: bool,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self {
            config_dirs: HashMap::new(),
            additional_sources: Vec::new(),
            ignore_unresolvable_nested: false,
            detectors: DetectorChain::new(),
            aliases: EnvAliases::new(),
            append_command_line: String::new(),
            include_profiles: Vec::new(),
            args: None,
            loaders: PropertiesLoaders::default(),
            system_environment: true,
        }
    }
}

impl fmt::Debug for EnvironmentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentBuilder")
            .field("config_dirs", &self.config_dirs)
            .field("additional_sources", &self.additional_sources.len())
            .field("ignore_unresolvable_nested", &self.ignore_unresolvable_nested)
            .field("append_command_line", &self.append_command_line)
            .field("include_profiles", &self.include_profiles)
            .field("system_environment", &self.system_environment)
            .finish_non_exhaustive()
    }
}

impl EnvironmentBuilder {
    /// 创建构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定环境的配置目录，未指定时使用 `./config`，目录不存在时使用工作目录
    pub fn config_dir(mut self, env: Env, dir: impl Into<PathBuf>) -> Self {
        self.config_dirs.insert(env, dir.into());
        self
    }

    /// 所有环境使用同一个配置目录
    pub fn config_dir_for_all(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        for env in [Env::Dev, Env::Test, Env::Fat, Env::Prod] {
            self.config_dirs.insert(env, dir.clone());
        }
        self
    }

    /// 附加配置源，优先级低于配置文件、高于系统环境变量
    pub fn additional_source(mut self, source: Arc<dyn PropertySource>) -> Self {
        self.additional_sources.push(source);
        self
    }

    /// 批量附加配置源
    pub fn additional_sources<I>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn PropertySource>>,
    {
        self.additional_sources.extend(sources);
        self
    }

    /// 读取配置值时是否忽略无法解析的嵌套占位符，默认不忽略
    pub fn ignore_unresolvable_nested_placeholders(mut self, ignore: bool) -> Self {
        self.ignore_unresolvable_nested = ignore;
        self
    }

    /// 直接指定运行信息，不再执行检测
    pub fn custom_run_info(mut self, run_info: RunInfo) -> Self {
        self.detectors.custom_run_info(run_info);
        self
    }

    /// 追加命令行参数，与已有参数同名时覆盖
    pub fn append_command_line(mut self, command_line: &str) -> Self {
        self.append_command_line.push(' ');
        self.append_command_line.push_str(command_line);
        self
    }

    /// 额外激活的 profile，在配置中声明的 profile 之后加载
    pub fn include_profiles<I, S>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_profiles
            .extend(profiles.into_iter().map(Into::into));
        self
    }

    /// 命令行参数，默认取进程参数
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// 添加运行环境检测器
    pub fn detector(mut self, detector: Detector) -> Self {
        self.detectors.add_last(detector);
        self
    }

    /// 指定检测器执行顺序
    pub fn detector_order<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.detectors.define_order(names);
        self
    }

    /// 定义环境别名
    pub fn env_alias(mut self, alias: &str, env: Env) -> Self {
        self.aliases.define(alias, env);
        self
    }

    /// 替换配置文件加载器集合
    pub fn loaders(mut self, loaders: PropertiesLoaders) -> Self {
        self.loaders = loaders;
        self
    }

    /// 是否加入系统环境变量配置源，默认加入
    pub fn system_environment(mut self, enabled: bool) -> Self {
        self.system_environment = enabled;
        self
    }

    /// 构建配置环境
    ///
    /// # 返回
    /// * `Result<Arc<StandardEnvironment>, EnvError>` - 组装后的配置环境
    pub fn build(self) -> Result<Arc<StandardEnvironment>, EnvError> {
        let args = self
            .args
            .unwrap_or_else(|| std::env::args().skip(1).collect());

        let run_info = self.detectors.detect(&DetectContext {
            args: &args,
            aliases: &self.aliases,
        });
        info!("当前运行信息: {}", run_info);

        let config_dir = resolve_config_dir(&self.config_dirs, &run_info);
        info!("配置文件目录为: {}", config_dir.display());

        let sources = Arc::new(PropertySources::new());
        sources.add_last(Arc::new(command_line_source(
            &args,
            &self.append_command_line,
        )));
        sources.add_last(Arc::new(MapPropertySource::new(
            RUN_INFO_SOURCE_NAME,
            run_info.to_properties(),
        )));
        sources.add_last(Arc::new(MapPropertySource::new(
            DEFAULT_APPLICATION_SOURCE_NAME,
            load_default_application(&config_dir, &self.loaders),
        )));
        for source in self.additional_sources {
            if !sources.contains(source.name()) {
                sources.add_last(source);
            }
        }
        if self.system_environment {
            sources.add_last(Arc::new(system_environment_source()));
        }

        let environment = Arc::new(StandardEnvironment {
            resolver: PropertySourcesPropertyResolver::new(
                Arc::clone(&sources),
                self.ignore_unresolvable_nested,
            ),
            sources,
            run_info,
            config_dir,
            loaders: self.loaders,
            active_profiles: RwLock::new(Vec::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            watched: Mutex::new(Vec::new()),
            bound: RwLock::new(HashMap::new()),
        });

        environment.initialize(&self.include_profiles);
        Ok(environment)
    }
}

/// 计算配置目录：指定目录存在时使用指定目录，否则使用工作目录
fn resolve_config_dir(config_dirs: &HashMap<Env, PathBuf>, run_info: &RunInfo) -> PathBuf {
    let configured = config_dirs
        .get(&run_info.env)
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));

    if configured.is_dir() {
        configured
    } else {
        debug!(
            "配置目录[{}]不存在，使用工作目录[{}]",
            configured.display(),
            run_info.work_dir.display()
        );
        run_info.work_dir.clone()
    }
}

/// 配置目录下的文件，按文件名排序
fn list_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取配置目录[{}]失败: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn default_application_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^(app|application)\.[^.]+$").ok())
        .as_ref()
}

/// 合并配置目录下的 `app.*` 与 `application.*` 文件，文件名靠后的覆盖靠前的
fn load_default_application(config_dir: &Path, loaders: &PropertiesLoaders) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    let Some(pattern) = default_application_pattern() else {
        return properties;
    };

    for path in list_files(config_dir) {
        let matched = file_name(&path).is_some_and(|name| pattern.is_match(name));
        if !matched || !loaders.supports(&path) {
            continue;
        }
        match loaders.load(&path) {
            Ok(loaded) => properties.extend(loaded),
            Err(e) => warn!("读取配置文件[{}]异常: {}", path.display(), e),
        }
    }
    properties
}

fn profile_separator() -> Option<&'static Regex> {
    static SEPARATOR: OnceLock<Option<Regex>> = OnceLock::new();
    SEPARATOR
        .get_or_init(|| Regex::new(r"[,，;；\s]+").ok())
        .as_ref()
}

/// 拆分 profile 列表，支持中英文逗号、分号与空白
pub fn split_profiles(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }
    match profile_separator() {
        Some(separator) => separator
            .split(value)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        None => vec![value.to_string()],
    }
}

/// 标准配置环境
pub struct StandardEnvironment {
    sources: Arc<PropertySources>,
    resolver: PropertySourcesPropertyResolver,
    run_info: RunInfo,
    config_dir: PathBuf,
    loaders: PropertiesLoaders,
    active_profiles: RwLock<Vec<String>>,
    listeners: Arc<ListenerRegistry>,
    watched: Mutex<Vec<Weak<dyn PropertySource>>>,
    bound: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for StandardEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardEnvironment")
            .field("run_info", &self.run_info)
            .field("config_dir", &self.config_dir)
            .field("sources", &self.sources.names())
            .field("active_profiles", &self.active_profiles())
            .finish_non_exhaustive()
    }
}

impl StandardEnvironment {
    /// 创建构建器
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// 订阅配置源集合变更，监听已有配置源并激活 profile
    fn initialize(self: &Arc<Self>, include_profiles: &[String]) {
        let environment = Arc::downgrade(self);
        self.sources.subscribe(Arc::new(
            move |_sources: &PropertySources,
                  change_type: SourcesChangeType,
                  source: &Arc<dyn PropertySource>| {
                if !matches!(change_type, SourcesChangeType::Add | SourcesChangeType::Update) {
                    return;
                }
                if let Some(environment) = environment.upgrade() {
                    environment.watch_source(source);
                    environment.include_profiles_of(source);
                }
            },
        ));

        let existing = self.sources.snapshot();
        for source in existing.iter() {
            self.watch_source(source);
        }
        for source in existing.iter().rev() {
            self.include_profiles_of(source);
        }

        if !include_profiles.is_empty() {
            self.activate_profiles(include_profiles);
        }
        info!(
            "配置环境初始化完成, 配置源:{:?}, 激活的profile:{:?}",
            self.sources.names(),
            self.active_profiles()
        );
    }

    /// 将配置源的变更事件转发给环境级监听器，每个配置源只转发一次
    fn watch_source(&self, source: &Arc<dyn PropertySource>) {
        {
            let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
            if !remember_source(&mut watched, source) {
                return;
            }
        }

        let listeners = Arc::downgrade(&self.listeners);
        let name = source.name().to_string();
        source.subscribe(
            "*",
            Arc::new(move |event: &KeyChangeEvent| {
                let Some(listeners) = listeners.upgrade() else {
                    return;
                };
                info!("收到配置来源[{}]的配置变更事件: {}", name, event);
                listeners.notify(&name, event);
            }),
        );
    }

    /// 检查配置源中声明的 profile 并加载对应的配置文件
    fn include_profiles_of(&self, source: &Arc<dyn PropertySource>) {
        let Some(include) = source
            .get_property(PROFILE_INCLUDE_KEY)
            .filter(|value| !value.trim().is_empty())
        else {
            return;
        };

        match self.resolve_placeholders(&include) {
            Ok(include) => self.activate_profiles(&split_profiles(&include)),
            Err(e) => warn!(
                "配置源[{}]中的[{}]解析失败: {}",
                source.name(),
                PROFILE_INCLUDE_KEY,
                e
            ),
        }
    }

    fn activate_profiles(&self, profiles: &[String]) {
        for profile in profiles {
            if self.load_profile(profile) {
                let mut active = self
                    .active_profiles
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if !active.contains(profile) {
                    active.push(profile.clone());
                }
            }
        }
    }

    /// 加载 `application-<profile>.*` 文件，每个文件作为一个以文件名命名的配置源
    fn load_profile(&self, profile: &str) -> bool {
        let prefix = format!("application-{profile}.");
        let mut loaded = false;

        for path in list_files(&self.config_dir) {
            let Some(name) = file_name(&path) else {
                continue;
            };
            if !name.starts_with(&prefix) || !self.loaders.supports(&path) {
                continue;
            }
            if self.sources.contains(name) {
                loaded = true;
                continue;
            }

            let properties = match self.loaders.load(&path) {
                Ok(properties) => properties,
                Err(e) => {
                    warn!("读取配置文件[{}]异常: {}", path.display(), e);
                    continue;
                }
            };

            info!("激活profile[{}], 加载配置文件: {}", profile, path.display());
            let source: Arc<dyn PropertySource> = Arc::new(MapPropertySource::new(name, properties));
            self.add_profile_source(source);
            loaded = true;
        }
        loaded
    }

    /// profile 配置源紧跟在默认配置文件之后，后加载的优先
    fn add_profile_source(&self, source: Arc<dyn PropertySource>) {
        let pivot = if self.sources.contains(DEFAULT_APPLICATION_SOURCE_NAME) {
            DEFAULT_APPLICATION_SOURCE_NAME
        } else {
            RUN_INFO_SOURCE_NAME
        };
        if let Err(e) = self.sources.add_after(pivot, Arc::clone(&source)) {
            debug!("插入profile配置源[{}]失败，放到最后: {}", source.name(), e);
            match self.sources.get(SYSTEM_ENVIRONMENT_SOURCE_NAME) {
                Some(_) => {
                    if let Err(e) = self
                        .sources
                        .add_before(SYSTEM_ENVIRONMENT_SOURCE_NAME, Arc::clone(&source))
                    {
                        warn!("插入profile配置源[{}]失败: {}", source.name(), e);
                    }
                }
                None => self.sources.add_last(source),
            }
        }
    }

    /// 配置目录
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// 是否开发环境
    pub fn is_dev(&self) -> bool {
        self.run_info.is_dev()
    }

    /// 是否测试环境
    pub fn is_test(&self) -> bool {
        self.run_info.is_test()
    }

    /// 是否预发布环境
    pub fn is_fat(&self) -> bool {
        self.run_info.is_fat()
    }

    /// 是否生产环境
    pub fn is_prod(&self) -> bool {
        self.run_info.is_prod()
    }

    /// 部署集
    pub fn set(&self) -> &str {
        &self.run_info.set
    }

    /// 工作目录
    pub fn work_dir(&self) -> &Path {
        &self.run_info.work_dir
    }

    /// 合并父环境：父环境中名称不存在的配置源以最低优先级加入，激活的 profile 追加在后
    pub fn merge(&self, parent: &dyn Environment) {
        parent.property_sources().each(|_, source| {
            if !self.sources.contains(source.name()) {
                self.sources.add_last(Arc::clone(source));
            }
            ControlFlow::Continue(())
        });

        let parent_profiles = parent.active_profiles();
        if !parent_profiles.is_empty() {
            self.active_profiles
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(parent_profiles);
        }
    }

    /// 合并后的所有配置项原始值，同名 key 取优先级高的配置源
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        self.sources.each_revert(|_, source| {
            source.each(&mut |key, value| {
                properties.insert(key.to_string(), value.to_string());
                ControlFlow::Continue(())
            });
            ControlFlow::Continue(())
        });
        properties
    }

    /// 按 key 顺序遍历合并后的配置项，返回 `Break` 时停止
    pub fn each_property<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &str) -> ControlFlow<()>,
    {
        for (key, value) in &self.properties() {
            if visit(key, value).is_break() {
                return;
            }
        }
    }

    /// 读取配置并转换为指定类型
    pub fn get_as<T: FromProperty>(&self, key: &str) -> Result<Option<T>, EnvError> {
        match self.get_property(key)? {
            Some(value) => Ok(Some(T::from_property(&value)?)),
            None => Ok(None),
        }
    }

    /// 将配置绑定到结构体，绑定结果按类型登记，可通过 [`get_bound`](Self::get_bound) 取回
    ///
    /// # 参数
    /// * `prefix` - key 前缀
    /// * `target` - 绑定目标
    /// * `live` - 是否随配置变更自动更新
    pub fn bind_properties<T: Bindable>(
        self: &Arc<Self>,
        prefix: &str,
        target: T,
        live: bool,
    ) -> Result<Bound<T>, BindError> {
        let context: Arc<dyn BindContext> = Arc::clone(self) as Arc<dyn BindContext>;
        let bound = bind_properties(context, prefix, target, live)?;
        self.bound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Box::new(bound.clone()));
        Ok(bound)
    }

    /// 取回通过本环境绑定的结构体，同一类型多次绑定时返回最后一次的结果
    pub fn get_bound<T: Bindable>(&self) -> Option<Bound<T>> {
        self.bound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .and_then(|bound| bound.downcast_ref::<Bound<T>>())
            .cloned()
    }
}

impl PropertyResolver for StandardEnvironment {
    fn contains_property(&self, key: &str) -> bool {
        self.resolver.contains_property(key)
    }

    fn get_property(&self, key: &str) -> Result<Option<String>, ResolveError> {
        self.resolver.get_property(key)
    }

    fn resolve_placeholders(&self, text: &str) -> Result<String, ResolveError> {
        self.resolver.resolve_placeholders(text)
    }

    fn resolve_required_placeholders(&self, text: &str) -> Result<String, ResolveError> {
        self.resolver.resolve_required_placeholders(text)
    }

    fn resolve_nested_placeholders(&self, text: &str) -> Result<String, ResolveError> {
        self.resolver.resolve_nested_placeholders(text)
    }
}

impl Environment for StandardEnvironment {
    fn property_sources(&self) -> &Arc<PropertySources> {
        &self.sources
    }

    fn active_profiles(&self) -> Vec<String> {
        self.active_profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run_info(&self) -> &RunInfo {
        &self.run_info
    }

    fn subscribe(&self, key_pattern: &str, handler: ChangeHandler) {
        self.listeners.subscribe(key_pattern, handler);
    }
}

impl BindContext for StandardEnvironment {
    fn property_keys(&self) -> Vec<String> {
        self.properties().into_keys().collect()
    }

    fn subscribe(&self, key_pattern: &str, handler: ChangeHandler) {
        Environment::subscribe(self, key_pattern, handler);
    }
}

/// 记录已转发的配置源，先清理已释放的配置源
///
/// # 返回
/// * `bool` - 配置源此前未被记录时返回 `true`
fn remember_source(
    watched: &mut Vec<Weak<dyn PropertySource>>,
    source: &Arc<dyn PropertySource>,
) -> bool {
    watched.retain(|w| w.strong_count() > 0);
    let address = Arc::as_ptr(source);
    if watched
        .iter()
        .any(|w| std::ptr::addr_eq(w.as_ptr(), address))
    {
        return false;
    }
    watched.push(Arc::downgrade(source));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::binder::FieldTable;
    use crate::config::command_line::COMMAND_LINE_SOURCE_NAME;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn builder(dir: &TempDir) -> EnvironmentBuilder {
        StandardEnvironment::builder()
            .config_dir_for_all(dir.path())
            .custom_run_info(RunInfo::new(Env::Dev, "").with_work_dir(dir.path()))
            .system_environment(false)
            .args(Vec::<String>::new())
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_split_profiles() {
        assert_eq!(split_profiles("a, b；c d，e;f"), vec!["a", "b", "c", "d", "e", "f"]);
        assert!(split_profiles("  ").is_empty());
    }

    #[test]
    fn test_assembly_order_and_precedence() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "application.properties", "name=file\nonly.file=1\n");

        let extra: Arc<dyn PropertySource> = Arc::new(MapPropertySource::new(
            "extra",
            HashMap::from([
                ("name".to_string(), "extra".to_string()),
                ("only.extra".to_string(), "2".to_string()),
            ]),
        ));
        let env = builder(&dir)
            .args(["--name=cli", "ignored"])
            .additional_source(extra)
            .build()
            .unwrap();

        assert_eq!(
            env.property_sources().names(),
            vec![
                COMMAND_LINE_SOURCE_NAME,
                RUN_INFO_SOURCE_NAME,
                DEFAULT_APPLICATION_SOURCE_NAME,
                "extra"
            ]
        );
        assert_eq!(env.get_property("name").unwrap().as_deref(), Some("cli"));
        assert_eq!(env.get_property("only.file").unwrap().as_deref(), Some("1"));
        assert_eq!(env.get_property("only.extra").unwrap().as_deref(), Some("2"));
        assert_eq!(env.get_property("runInfo.env").unwrap().as_deref(), Some("dev"));
        assert_eq!(env.properties()["name"], "cli");
        assert!(env.is_dev());
        assert_eq!(env.config_dir(), dir.path());
    }

    #[test]
    fn test_profiles_are_loaded_after_default_application() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "application.yaml",
            "envkit:\n  profile:\n    include: db, ${extra.profile:cache}\nname: default\n",
        );
        write(dir.path(), "application-db.properties", "name=db\ndb.url=mysql://db\n");
        write(dir.path(), "application-cache.yaml", "name: cache\ncache:\n  size: 10\n");
        write(dir.path(), "application-unused.properties", "name=unused\n");

        let env = builder(&dir).build().unwrap();

        assert_eq!(env.active_profiles(), vec!["db", "cache"]);
        assert_eq!(
            env.property_sources().names(),
            vec![
                COMMAND_LINE_SOURCE_NAME,
                RUN_INFO_SOURCE_NAME,
                DEFAULT_APPLICATION_SOURCE_NAME,
                "application-cache.yaml",
                "application-db.properties",
            ]
        );
        assert_eq!(env.get_property("name").unwrap().as_deref(), Some("default"));
        assert_eq!(env.get_property("db.url").unwrap().as_deref(), Some("mysql://db"));
        assert_eq!(env.get_as::<u32>("cache.size").unwrap(), Some(10));
        assert_eq!(env.get_property("name.unused").unwrap(), None);
    }

    #[test]
    fn test_builder_profiles_and_dynamic_include() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "application-extra.properties", "extra=1\n");
        write(dir.path(), "application-late.properties", "late=1\n");

        let env = builder(&dir).include_profiles(["extra", "missing"]).build().unwrap();
        assert_eq!(env.active_profiles(), vec!["extra"]);

        env.property_sources().add_last(Arc::new(MapPropertySource::new(
            "remote",
            HashMap::from([(PROFILE_INCLUDE_KEY.to_string(), "late".to_string())]),
        )));
        assert_eq!(env.active_profiles(), vec!["extra", "late"]);
        assert_eq!(env.get_property("late").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_environment_listeners_follow_all_sources() {
        let dir = TempDir::new().unwrap();
        let env = builder(&dir).build().unwrap();
        let events = Arc::new(Mutex::new(Vec::<KeyChangeEvent>::new()));
        let sink = Arc::clone(&events);
        Environment::subscribe(
            env.as_ref(),
            r"^app\..*",
            Arc::new(move |event: &KeyChangeEvent| sink.lock().unwrap().push(event.clone())),
        );

        let late = Arc::new(MapPropertySource::empty("late"));
        env.property_sources()
            .add_first(Arc::clone(&late) as Arc<dyn PropertySource>);
        late.put("app.name", "demo");
        late.put("other", "x");

        assert!(wait_until(|| events.lock().unwrap().len() == 1));
        assert_eq!(events.lock().unwrap()[0], KeyChangeEvent::added("app.name", "demo"));
    }

    #[test]
    fn test_released_sources_are_forgotten() {
        let mut watched: Vec<Weak<dyn PropertySource>> = Vec::new();
        let kept: Arc<dyn PropertySource> = Arc::new(MapPropertySource::empty("kept"));
        assert!(remember_source(&mut watched, &kept));
        assert!(!remember_source(&mut watched, &kept));

        for i in 0..10 {
            let temporary: Arc<dyn PropertySource> =
                Arc::new(MapPropertySource::empty(format!("tmp-{i}")));
            assert!(remember_source(&mut watched, &temporary));
        }
        assert!(watched.len() <= 2);

        let other: Arc<dyn PropertySource> = Arc::new(MapPropertySource::empty("other"));
        assert!(remember_source(&mut watched, &other));
        assert_eq!(watched.len(), 2);
    }

    #[test]
    fn test_merge_parent_environment() {
        let parent_dir = TempDir::new().unwrap();
        write(parent_dir.path(), "application-p.properties", "from.parent=1\n");
        let parent = builder(&parent_dir).include_profiles(["p"]).build().unwrap();

        let child_dir = TempDir::new().unwrap();
        let child = builder(&child_dir).build().unwrap();
        child.merge(parent.as_ref());

        assert_eq!(child.active_profiles(), vec!["p"]);
        assert_eq!(child.get_property("from.parent").unwrap().as_deref(), Some("1"));
        assert_eq!(
            child.property_sources().names().last().map(String::as_str),
            Some("application-p.properties")
        );
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Server {
        port: u16,
        host: String,
    }

    impl Bindable for Server {
        fn describe(fields: &mut FieldTable<Self>) {
            fields.value("port", |s| &mut s.port).default("8080");
            fields.value("host", |s| &mut s.host).default("${runInfo.env}.local");
        }
    }

    #[test]
    fn test_bind_and_registry() {
        let dir = TempDir::new().unwrap();
        let env = builder(&dir).args(["--server.port=9090"]).build().unwrap();

        let bound = env.bind_properties("server", Server::default(), false).unwrap();
        assert_eq!(
            bound.get(),
            Server {
                port: 9090,
                host: "dev.local".into()
            }
        );
        assert_eq!(env.get_bound::<Server>().unwrap().get().port, 9090);
    }

    #[test]
    fn test_missing_config_dir_falls_back_to_work_dir() {
        let work = TempDir::new().unwrap();
        write(work.path(), "app.properties", "k=v\n");
        let env = StandardEnvironment::builder()
            .config_dir(Env::Prod, work.path().join("missing"))
            .custom_run_info(RunInfo::new(Env::Prod, "eu").with_work_dir(work.path()))
            .system_environment(false)
            .args(Vec::<String>::new())
            .build()
            .unwrap();

        assert_eq!(env.config_dir(), work.path());
        assert!(env.is_prod());
        assert_eq!(env.set(), "eu");
        assert_eq!(env.get_property("k").unwrap().as_deref(), Some("v"));
    }
}
