//! 配置文件加载器实现
//!
//! 将 `.properties`、YAML 与 TOML 配置文件解析为扁平的 `key -> value` 表。
//! 嵌套结构按 `.` 连接成 key，数组等集合类型编码为 JSON 字符串。

use crate::config::polling::PropertyReader;
use crate::error::LoadError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// 配置文件加载器trait，定义配置加载接口
pub trait PropertiesLoader: Send + Sync {
    /// 加载器名称
    fn name(&self) -> &'static str;

    /// 支持的文件扩展名（小写）
    fn extensions(&self) -> &'static [&'static str];

    /// 解析配置内容
    ///
    /// # 参数
    /// * `content` - 文件内容
    /// * `path` - 文件路径，仅用于错误信息
    ///
    /// # 返回
    /// * `Result<HashMap<String, String>, LoadError>` - 扁平化后的配置表
    fn parse(&self, content: &str, path: &Path) -> Result<HashMap<String, String>, LoadError>;

    /// 是否支持指定文件
    fn supports(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.extensions().contains(&ext.as_str()))
    }

    /// 从文件加载配置
    fn load(&self, path: &Path) -> Result<HashMap<String, String>, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let properties = self.parse(&content, path)?;
        info!("成功加载配置文件: {}", path.display());
        debug!("配置文件 {} 共 {} 项", path.display(), properties.len());
        Ok(properties)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn parse_error(path: &Path, reason: impl ToString) -> LoadError {
    LoadError::Parse {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Java properties 格式加载器
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertiesFileLoader;

impl PropertiesLoader for PropertiesFileLoader {
    fn name(&self) -> &'static str {
        "properties"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["properties", "prop", "props"]
    }

    fn parse(&self, content: &str, path: &Path) -> Result<HashMap<String, String>, LoadError> {
        parse_properties(content).map_err(|reason| parse_error(path, reason))
    }
}

/// 解析 Java properties 格式文本
///
/// 支持 `#`/`!` 注释、`=`/`:`/空白分隔符、行尾反斜杠续行以及 `\t`、`\n`、`\uXXXX` 等转义。
pub fn parse_properties(content: &str) -> Result<HashMap<String, String>, String> {
    let mut properties = HashMap::new();
    let mut lines = content.lines().enumerate();

    while let Some((line_no, line)) = lines.next() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }

        let mut logical = String::new();
        let mut current = trimmed.to_string();
        while ends_with_continuation(&current) {
            current.pop();
            logical.push_str(&current);
            match lines.next() {
                Some((_, next)) => current = next.trim_start().to_string(),
                None => {
                    current = String::new();
                    break;
                }
            }
        }
        logical.push_str(&current);

        let (key, value) = split_key_value(&logical);
        let key = unescape(key).map_err(|e| format!("第{}行: {}", line_no + 1, e))?;
        let value = unescape(value).map_err(|e| format!("第{}行: {}", line_no + 1, e))?;
        properties.insert(key, value);
    }

    Ok(properties)
}

/// 行尾存在奇数个反斜杠时表示续行
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_key_value(line: &str) -> (&str, &str) {
    let mut escaped = false;
    let mut key_end = line.len();
    for (index, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' | '\u{c}' => {
                key_end = index;
                break;
            }
            _ => {}
        }
    }

    let key = &line[..key_end];
    let mut rest = line[key_end..].trim_start_matches([' ', '\t', '\u{c}']);
    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = stripped.trim_start_matches([' ', '\t', '\u{c}']);
    }
    (key, rest)
}

fn unescape(text: &str) -> Result<String, String> {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => result.push('\t'),
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('f') => result.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 4)
                    .and_then(char::from_u32)
                    .ok_or_else(|| format!("非法的unicode转义: \\u{hex}"))?;
                result.push(code);
            }
            Some(other) => result.push(other),
            None => {}
        }
    }
    Ok(result)
}

/// YAML 格式加载器
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlFileLoader;

impl PropertiesLoader for YamlFileLoader {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["yaml", "yml"]
    }

    fn parse(&self, content: &str, path: &Path) -> Result<HashMap<String, String>, LoadError> {
        let document: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| parse_error(path, format!("YAML解析失败: {e}")))?;

        let mut properties = HashMap::new();
        match document {
            serde_yaml::Value::Null => {}
            serde_yaml::Value::Mapping(mapping) => {
                for (key, value) in mapping {
                    let key = yaml_key(&key).ok_or_else(|| parse_error(path, "不支持的YAML key类型"))?;
                    flatten_yaml(&key, value, &mut properties)
                        .map_err(|e| parse_error(path, e))?;
                }
            }
            _ => return Err(parse_error(path, "YAML顶层必须是映射结构")),
        }
        Ok(properties)
    }
}

fn yaml_key(key: &serde_yaml::Value) -> Option<String> {
    match key {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flatten_yaml(
    prefix: &str,
    value: serde_yaml::Value,
    properties: &mut HashMap<String, String>,
) -> Result<(), String> {
    use serde_yaml::Value;

    match value {
        Value::Null => {}
        Value::Bool(b) => {
            properties.insert(prefix.to_string(), b.to_string());
        }
        Value::Number(n) => {
            properties.insert(prefix.to_string(), n.to_string());
        }
        Value::String(s) => {
            properties.insert(prefix.to_string(), s);
        }
        Value::Sequence(_) => {
            let json = serde_json::to_string(&value).map_err(|e| e.to_string())?;
            properties.insert(prefix.to_string(), json);
        }
        Value::Mapping(mapping) => {
            for (key, child) in mapping {
                let key = yaml_key(&key).ok_or_else(|| format!("[{prefix}] 下存在不支持的key类型"))?;
                flatten_yaml(&format!("{prefix}.{key}"), child, properties)?;
            }
        }
        Value::Tagged(tagged) => flatten_yaml(prefix, tagged.value, properties)?,
    }
    Ok(())
}

/// TOML 格式加载器
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlFileLoader;

impl PropertiesLoader for TomlFileLoader {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["toml"]
    }

    fn parse(&self, content: &str, path: &Path) -> Result<HashMap<String, String>, LoadError> {
        let table: toml::Table =
            toml::from_str(content).map_err(|e| parse_error(path, format!("TOML解析失败: {e}")))?;

        let mut properties = HashMap::new();
        for (key, value) in table {
            flatten_toml(&key, value, &mut properties).map_err(|e| parse_error(path, e))?;
        }
        Ok(properties)
    }
}

fn flatten_toml(
    prefix: &str,
    value: toml::Value,
    properties: &mut HashMap<String, String>,
) -> Result<(), String> {
    use toml::Value;

    match value {
        Value::String(s) => {
            properties.insert(prefix.to_string(), s);
        }
        Value::Integer(i) => {
            properties.insert(prefix.to_string(), i.to_string());
        }
        Value::Float(f) => {
            properties.insert(prefix.to_string(), f.to_string());
        }
        Value::Boolean(b) => {
            properties.insert(prefix.to_string(), b.to_string());
        }
        Value::Datetime(dt) => {
            properties.insert(prefix.to_string(), dt.to_string());
        }
        Value::Array(_) => {
            let json = serde_json::to_string(&value).map_err(|e| e.to_string())?;
            properties.insert(prefix.to_string(), json);
        }
        Value::Table(table) => {
            for (key, child) in table {
                flatten_toml(&format!("{prefix}.{key}"), child, properties)?;
            }
        }
    }
    Ok(())
}

/// 按扩展名选择加载器的加载器集合
#[derive(Clone)]
pub struct PropertiesLoaders {
    loaders: Vec<Arc<dyn PropertiesLoader>>,
}

impl std::fmt::Debug for PropertiesLoaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.loaders.iter().map(|l| l.name()).collect();
        f.debug_struct("PropertiesLoaders")
            .field("loaders", &names)
            .finish()
    }
}

impl Default for PropertiesLoaders {
    fn default() -> Self {
        Self {
            loaders: vec![
                Arc::new(PropertiesFileLoader),
                Arc::new(YamlFileLoader),
                Arc::new(TomlFileLoader),
            ],
        }
    }
}

impl PropertiesLoaders {
    /// 创建空的加载器集合
    pub fn empty() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    /// 注册加载器，后注册的优先匹配
    pub fn register(&mut self, loader: Arc<dyn PropertiesLoader>) {
        self.loaders.insert(0, loader);
    }

    /// 查找支持指定文件的加载器
    pub fn loader_for(&self, path: &Path) -> Option<Arc<dyn PropertiesLoader>> {
        self.loaders
            .iter()
            .find(|loader| loader.supports(path))
            .cloned()
    }

    /// 是否支持指定文件
    pub fn supports(&self, path: &Path) -> bool {
        self.loader_for(path).is_some()
    }

    /// 加载配置文件
    pub fn load(&self, path: &Path) -> Result<HashMap<String, String>, LoadError> {
        self.loader_for(path)
            .ok_or_else(|| LoadError::UnsupportedFormat {
                path: path.display().to_string(),
            })?
            .load(path)
    }

    /// 为配置文件创建轮询读取器
    pub fn reader(&self, path: impl Into<PathBuf>) -> Result<FilePropertyReader, LoadError> {
        let path = path.into();
        let loader = self
            .loader_for(&path)
            .ok_or_else(|| LoadError::UnsupportedFormat {
                path: path.display().to_string(),
            })?;
        Ok(FilePropertyReader::new(path, loader))
    }
}

/// 每次读取时重新解析配置文件的读取器，可作为轮询配置源的数据来源
pub struct FilePropertyReader {
    path: PathBuf,
    loader: Arc<dyn PropertiesLoader>,
}

impl FilePropertyReader {
    /// 创建文件读取器
    pub fn new(path: impl Into<PathBuf>, loader: Arc<dyn PropertiesLoader>) -> Self {
        Self {
            path: path.into(),
            loader,
        }
    }

    /// 文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PropertyReader for FilePropertyReader {
    async fn read_all(&self) -> Result<HashMap<String, String>, LoadError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| LoadError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        self.loader.parse(&content, &self.path)
    }
}
