//! envkit - 分层、可动态刷新的配置环境
//!
//! 这是一个用Rust编写的配置环境库，支持：
//! - 多来源分层配置（命令行、运行信息、配置文件、profile、环境变量、轮询来源）
//! - `${key:default}` 占位符解析
//! - 配置变更通知与轮询刷新
//! - 结构体绑定与配置变更自动更新
//! - 结构化日志记录

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod placeholder;
pub mod version;

// 重新导出主要类型
pub use config::{
    bind_properties, Bindable, Bound, Environment, EnvironmentBuilder, FieldTable, KeyChangeEvent,
    PropertyResolver, PropertySource, PropertySources, StandardEnvironment,
};
pub use error::{EnvError, Result};
pub use logging::{LogConfig, LoggingSystem, TraceContext};

/// 应用程序版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 应用程序名称
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// 应用程序描述
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
