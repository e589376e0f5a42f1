//! 配置解析模块
//!
//! 在有序配置源集合之上提供合并后的只读视图，按优先级取第一个命中的值并替换占位符。

use crate::config::sources::PropertySources;
use crate::error::ResolveError;
use crate::placeholder::PlaceholderResolver;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// 配置解析接口
pub trait PropertyResolver: Send + Sync {
    /// 是否配置了指定 key，不做占位符处理
    fn contains_property(&self, key: &str) -> bool;

    /// 获取配置值，返回值中的占位符已被替换
    ///
    /// # 参数
    /// * `key` - 配置 key
    ///
    /// # 返回
    /// * `Result<Option<String>, ResolveError>` - 配置不存在时返回 `Ok(None)`；
    ///   循环引用或严格模式下无法解析的占位符返回错误
    fn get_property(&self, key: &str) -> Result<Option<String>, ResolveError>;

    /// 获取配置值，不存在时返回默认值
    fn get_property_or(&self, key: &str, default: &str) -> Result<String, ResolveError> {
        Ok(self
            .get_property(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    /// 获取必填配置，不存在时返回 [`ResolveError::RequiredPropertyMissing`]
    ///
    /// 通常在启动阶段调用，避免在配置不完整的状态下运行。
    fn get_required_property(&self, key: &str) -> Result<String, ResolveError> {
        self.get_property(key)?
            .ok_or_else(|| ResolveError::RequiredPropertyMissing {
                key: key.to_string(),
            })
    }

    /// 替换文本中的占位符，无法解析的占位符原样保留
    fn resolve_placeholders(&self, text: &str) -> Result<String, ResolveError>;

    /// 替换文本中的占位符，遇到无法解析的占位符返回错误
    fn resolve_required_placeholders(&self, text: &str) -> Result<String, ResolveError>;

    /// 使用与读取配置值相同的模式替换占位符，用于处理配置默认值
    fn resolve_nested_placeholders(&self, text: &str) -> Result<String, ResolveError> {
        self.resolve_placeholders(text)
    }
}

/// 基于配置源集合的配置解析器
#[derive(Debug)]
pub struct PropertySourcesPropertyResolver {
    sources: Arc<PropertySources>,
    ignore_unresolvable_nested: bool,
    lenient: OnceLock<PlaceholderResolver>,
    strict: OnceLock<PlaceholderResolver>,
}

impl PropertySourcesPropertyResolver {
    /// 创建配置解析器
    ///
    /// # 参数
    /// * `sources` - 配置源集合
    /// * `ignore_unresolvable_nested` - 读取配置值时是否忽略其中无法解析的占位符，
    ///   为 false 时无法解析的嵌套占位符会导致读取失败
    pub fn new(sources: Arc<PropertySources>, ignore_unresolvable_nested: bool) -> Self {
        Self {
            sources,
            ignore_unresolvable_nested,
            lenient: OnceLock::new(),
            strict: OnceLock::new(),
        }
    }

    /// 配置源集合
    pub fn sources(&self) -> &Arc<PropertySources> {
        &self.sources
    }

    /// 读取配置值时是否忽略无法解析的嵌套占位符
    pub fn ignores_unresolvable_nested(&self) -> bool {
        self.ignore_unresolvable_nested
    }

    /// 按优先级取第一个命中的原始值，不做占位符处理
    pub fn raw_property(&self, key: &str) -> Option<String> {
        let mut found = None;
        self.sources.each(|_, source| match source.get_property(key) {
            Some(value) => {
                debug!(
                    "Found key '{}' in PropertySource '{}' with value: {}",
                    key,
                    source.name(),
                    value
                );
                found = Some(value);
                ControlFlow::Break(())
            }
            None => ControlFlow::Continue(()),
        });
        found
    }

    fn lenient_resolver(&self) -> &PlaceholderResolver {
        self.lenient.get_or_init(PlaceholderResolver::lenient)
    }

    fn strict_resolver(&self) -> &PlaceholderResolver {
        self.strict.get_or_init(PlaceholderResolver::strict)
    }

    fn nested_resolver(&self) -> &PlaceholderResolver {
        if self.ignore_unresolvable_nested {
            self.lenient_resolver()
        } else {
            self.strict_resolver()
        }
    }

    fn resolve_with(
        &self,
        resolver: &PlaceholderResolver,
        text: &str,
    ) -> Result<String, ResolveError> {
        resolver.resolve(text, |key| self.raw_property(key))
    }
}

impl PropertyResolver for PropertySourcesPropertyResolver {
    fn contains_property(&self, key: &str) -> bool {
        let mut contains = false;
        self.sources.each(|_, source| {
            if source.contains_property(key) {
                contains = true;
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        contains
    }

    fn get_property(&self, key: &str) -> Result<Option<String>, ResolveError> {
        let Some(value) = self.raw_property(key) else {
            return Ok(None);
        };

        let resolver = self.nested_resolver();
        if value.len() < resolver.min_len() {
            return Ok(Some(value));
        }
        self.resolve_with(resolver, &value).map(Some)
    }

    fn resolve_placeholders(&self, text: &str) -> Result<String, ResolveError> {
        self.resolve_with(self.lenient_resolver(), text)
    }

    fn resolve_required_placeholders(&self, text: &str) -> Result<String, ResolveError> {
        self.resolve_with(self.strict_resolver(), text)
    }

    fn resolve_nested_placeholders(&self, text: &str) -> Result<String, ResolveError> {
        self.resolve_with(self.nested_resolver(), text)
    }
}
