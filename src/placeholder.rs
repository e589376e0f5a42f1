//! 占位符解析模块
//!
//! 处理形如 `${key}`、`${key:default}` 的占位符，支持嵌套占位符、默认值以及循环引用检测。
//! 解析算法只依赖一个 `key -> value` 的查找回调，不关心值从哪里来。

use crate::error::ResolveError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// 默认占位符前缀
pub const DEFAULT_PLACEHOLDER_PREFIX: &str = "${";
/// 默认占位符后缀
pub const DEFAULT_PLACEHOLDER_SUFFIX: &str = "}";
/// 默认的 key 与默认值之间的分隔符
pub const DEFAULT_VALUE_SEPARATOR: &str = ":";

/// 常见括号后缀对应的简单前缀，用于匹配嵌套占位符的结束位置
fn well_known_simple_prefix(suffix: &str) -> Option<&'static str> {
    match suffix {
        "}" => Some("{"),
        "]" => Some("["),
        ")" => Some("("),
        _ => None,
    }
}

/// 占位符解析器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderResolver {
    /// 占位符前缀，如 `${`
    prefix: String,
    /// 占位符后缀，如 `}`
    suffix: String,
    /// 用于追踪嵌套深度的简单前缀
    simple_prefix: String,
    /// 默认值分隔符
    value_separator: String,
    /// 是否忽略无法解析的占位符，为 false 时遇到无法解析的占位符直接返回错误
    ignore_unresolvable: bool,
    /// 需要处理的最小文本长度
    min_len: usize,
}

impl PlaceholderResolver {
    /// 创建占位符解析器，空字符串参数使用默认值
    ///
    /// # 参数
    /// * `prefix` - 占位符前缀
    /// * `suffix` - 占位符后缀
    /// * `value_separator` - 默认值分隔符
    /// * `ignore_unresolvable` - 是否忽略无法解析的占位符
    pub fn new(prefix: &str, suffix: &str, value_separator: &str, ignore_unresolvable: bool) -> Self {
        let prefix = if prefix.is_empty() {
            DEFAULT_PLACEHOLDER_PREFIX
        } else {
            prefix
        };
        let suffix = if suffix.is_empty() {
            DEFAULT_PLACEHOLDER_SUFFIX
        } else {
            suffix
        };
        let value_separator = if value_separator.is_empty() {
            DEFAULT_VALUE_SEPARATOR
        } else {
            value_separator
        };

        let simple_prefix = well_known_simple_prefix(suffix).unwrap_or(prefix);

        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            simple_prefix: simple_prefix.to_string(),
            value_separator: value_separator.to_string(),
            ignore_unresolvable,
            min_len: prefix.len() + suffix.len() + 1,
        }
    }

    /// 使用默认分隔符、忽略无法解析占位符的解析器
    pub fn lenient() -> Self {
        Self::new(
            DEFAULT_PLACEHOLDER_PREFIX,
            DEFAULT_PLACEHOLDER_SUFFIX,
            DEFAULT_VALUE_SEPARATOR,
            true,
        )
    }

    /// 使用默认分隔符、遇到无法解析占位符即失败的解析器
    pub fn strict() -> Self {
        Self::new(
            DEFAULT_PLACEHOLDER_PREFIX,
            DEFAULT_PLACEHOLDER_SUFFIX,
            DEFAULT_VALUE_SEPARATOR,
            false,
        )
    }

    /// 能够构成一个占位符的最小文本长度
    pub fn min_len(&self) -> usize {
        self.min_len
    }

    /// 是否忽略无法解析的占位符
    pub fn ignores_unresolvable(&self) -> bool {
        self.ignore_unresolvable
    }

    /// 替换文本中的占位符
    ///
    /// `lookup` 返回 `None` 或空字符串都视为配置不存在。
    ///
    /// # 参数
    /// * `text` - 待处理的文本
    /// * `lookup` - 配置查找回调
    ///
    /// # 返回
    /// * `Result<String, ResolveError>` - 替换后的文本；循环引用以及严格模式下的未解析占位符返回错误
    pub fn resolve<F>(&self, text: &str, mut lookup: F) -> Result<String, ResolveError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if text.len() < self.min_len {
            return Ok(text.to_string());
        }
        let mut visited = HashSet::new();
        self.parse_string_value(text, &mut visited, &mut lookup)
    }

    fn parse_string_value<F>(
        &self,
        value: &str,
        visited: &mut HashSet<String>,
        lookup: &mut F,
    ) -> Result<String, ResolveError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut result = value.to_string();
        let mut start = result.find(&self.prefix);

        while let Some(start_index) = start {
            let Some(end_index) = self.find_placeholder_end_index(&result, start_index) else {
                break;
            };

            let original = result[start_index + self.prefix.len()..end_index].to_string();
            if !visited.insert(original.clone()) {
                return Err(ResolveError::CircularPlaceholder {
                    placeholder: original,
                });
            }

            // key 本身也可能包含占位符
            let placeholder = self.parse_string_value(&original, visited, lookup)?;

            let mut prop_val = Self::lookup_non_empty(lookup, &placeholder);
            let mut use_default = false;
            if prop_val.is_none() {
                if let Some(separator_index) = placeholder.find(&self.value_separator) {
                    let actual = &placeholder[..separator_index];
                    let default_value = &placeholder[separator_index + self.value_separator.len()..];
                    prop_val = Self::lookup_non_empty(lookup, actual);
                    if prop_val.is_none() {
                        prop_val = Some(default_value.to_string());
                        use_default = true;
                    }
                }
            }

            match prop_val {
                Some(val) => {
                    let val = if use_default {
                        val
                    } else {
                        self.parse_string_value(&val, visited, lookup)?
                    };
                    result.replace_range(start_index..end_index + self.suffix.len(), &val);
                    start = find_from(&result, &self.prefix, start_index + val.len());
                }
                None if self.ignore_unresolvable => {
                    start = find_from(&result, &self.prefix, end_index + self.suffix.len());
                }
                None => {
                    return Err(ResolveError::UnresolvablePlaceholder {
                        placeholder,
                        value: value.to_string(),
                    });
                }
            }

            visited.remove(&original);
        }

        Ok(result)
    }

    fn lookup_non_empty<F>(lookup: &mut F, key: &str) -> Option<String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        lookup(key).filter(|v| !v.is_empty())
    }

    /// 从 start_index 开始查找与前缀匹配的后缀位置
    fn find_placeholder_end_index(&self, value: &str, start_index: usize) -> Option<usize> {
        let bytes = value.as_bytes();
        let suffix = self.suffix.as_bytes();
        let simple_prefix = self.simple_prefix.as_bytes();

        let mut index = start_index + self.prefix.len();
        let mut within_nested = 0usize;
        while index < bytes.len() {
            if bytes[index..].starts_with(suffix) {
                if within_nested > 0 {
                    within_nested -= 1;
                    index += suffix.len();
                } else {
                    return Some(index);
                }
            } else if bytes[index..].starts_with(simple_prefix) {
                within_nested += 1;
                index += simple_prefix.len();
            } else {
                index += 1;
            }
        }
        None
    }
}

impl Default for PlaceholderResolver {
    fn default() -> Self {
        Self::lenient()
    }
}

fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    haystack
        .get(from..)
        .and_then(|rest| rest.find(needle))
        .map(|index| index + from)
}

/// 按分隔符组合缓存的宽松解析器集合
#[derive(Debug, Default)]
pub struct PlaceholderRegistry {
    resolvers: RwLock<HashMap<(String, String, String), Arc<PlaceholderResolver>>>,
}

impl PlaceholderRegistry {
    /// 创建空的解析器集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（必要时创建）指定分隔符组合的宽松解析器
    pub fn get(&self, prefix: &str, suffix: &str, value_separator: &str) -> Arc<PlaceholderResolver> {
        let resolver = PlaceholderResolver::new(prefix, suffix, value_separator, true);
        let key = (
            resolver.prefix.clone(),
            resolver.suffix.clone(),
            resolver.value_separator.clone(),
        );

        if let Some(existing) = self
            .resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(existing);
        }

        let mut resolvers = self.resolvers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(resolvers.entry(key).or_insert_with(|| Arc::new(resolver)))
    }

    /// 使用指定分隔符组合，以参数表替换占位符
    pub fn resolve_ext(
        &self,
        text: &str,
        params: &HashMap<String, String>,
        prefix: &str,
        suffix: &str,
        value_separator: &str,
    ) -> Result<String, ResolveError> {
        self.get(prefix, suffix, value_separator)
            .resolve(text, |key| params.get(key).cloned())
    }
}

/// 使用默认分隔符，以参数表替换占位符，无法解析的占位符原样保留
pub fn resolve(text: &str, params: &HashMap<String, String>) -> Result<String, ResolveError> {
    PlaceholderResolver::lenient().resolve(text, |key| params.get(key).cloned())
}
