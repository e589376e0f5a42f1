//! 错误处理模块
//!
//! 定义属性环境的统一错误类型。解析类错误（必填配置缺失、占位符无法解析、
//! 循环引用）单独成族，调用方应当把它们视为启动期的致命错误。

use thiserror::Error;

/// envkit 的主要错误类型
#[derive(Error, Debug)]
pub enum EnvError {
    /// 配置来源集合结构错误
    #[error("配置来源错误: {0}")]
    Source(#[from] SourceError),

    /// 配置解析错误（致命）
    #[error("配置解析错误: {0}")]
    Resolve(#[from] ResolveError),

    /// 类型转换错误
    #[error("类型转换错误: {0}")]
    Convert(#[from] ConvertError),

    /// 配置绑定错误
    #[error("配置绑定错误: {0}")]
    Bind(#[from] BindError),

    /// 配置加载错误
    #[error("配置加载错误: {0}")]
    Load(#[from] LoadError),

    /// 版本号错误
    #[error("版本号错误: {0}")]
    Version(#[from] VersionError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON序列化/反序列化错误
    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 其他错误
    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

/// 配置来源集合的结构错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// 引用的配置来源不存在
    #[error("PropertySource named '{name}' does not exist")]
    NotFound { name: String },

    /// 配置来源不能相对于自身插入
    #[error("PropertySource named '{name}' cannot be added relative to itself")]
    SelfReference { name: String },
}

/// 配置解析错误，属于不可恢复的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// 必填配置项不存在
    #[error("Required key '{key}' not found")]
    RequiredPropertyMissing { key: String },

    /// 严格模式下占位符无法解析
    #[error("Could not resolve placeholder '{placeholder}' in value \"{value}\"")]
    UnresolvablePlaceholder { placeholder: String, value: String },

    /// 占位符循环引用
    #[error("Circular placeholder reference '{placeholder}' in property definitions")]
    CircularPlaceholder { placeholder: String },
}

/// 字符串到目标类型的转换错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("无法将 [{value}] 转换为 {type_name}: {reason}")]
pub struct ConvertError {
    /// 目标类型名称
    pub type_name: &'static str,
    /// 原始值
    pub value: String,
    /// 失败原因
    pub reason: String,
}

impl ConvertError {
    /// 创建转换错误
    pub fn new(type_name: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            type_name,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

/// 单个字段的绑定失败信息
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("配置转换失败, Property:[{owner}.{field}:{declared_type}], newVal:[{value}]: {source}")]
pub struct FieldError {
    /// 所属结构体类型名称
    pub owner: &'static str,
    /// 字段名称
    pub field: String,
    /// 字段声明类型
    pub declared_type: &'static str,
    /// 出错的配置值
    pub value: String,
    /// 底层转换错误
    #[source]
    pub source: ConvertError,
}

/// 结构体绑定错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// expand 字段的类型与所属类型相同，不允许嵌套
    #[error("[{owner}.{field}] 属性是expand类型的，不允许嵌套，不能是[{owner}]类型")]
    CyclicNesting { owner: &'static str, field: String },

    /// 绑定过程中出现致命的解析错误
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// 单个字段转换失败
    #[error(transparent)]
    Field(#[from] FieldError),
}

/// 配置文件加载与读取错误
#[derive(Error, Debug)]
pub enum LoadError {
    /// 不支持的文件类型
    #[error("不支持的配置文件类型: {path}")]
    UnsupportedFormat { path: String },

    /// 配置文件解析失败
    #[error("配置文件 {path} 解析失败: {reason}")]
    Parse { path: String, reason: String },

    /// 读取文件失败
    #[error("读取配置文件 {path} 失败: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 配置读取器失败
    #[error("配置读取失败: {0}")]
    Reader(String),
}

/// 版本号比较错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// 两个版本号都不合法
    #[error("版本号 [{0}] 与 [{1}] 都不合法")]
    BothInvalid(String, String),

    /// 第一个版本号不合法
    #[error("版本号 [{0}] 不合法")]
    FirstInvalid(String),

    /// 第二个版本号不合法
    #[error("版本号 [{0}] 不合法")]
    SecondInvalid(String),

    /// 版本限制配置不是合法的 JSON
    #[error("版本限制配置解析失败: {0}")]
    Limit(String),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, EnvError>;
