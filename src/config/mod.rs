//! 配置环境模块
//!
//! 提供分层配置源、占位符解析、配置变更通知、轮询刷新以及结构体绑定功能

pub mod binder;
pub mod command_line;
pub mod convert;
pub mod environment;
pub mod event;
pub mod loader;
pub mod polling;
pub mod resolver;
pub mod run_info;
pub mod source;
pub mod sources;
pub mod system;

// 重新导出主要类型
pub use binder::{bind_properties, BindContext, Bindable, Bound, FieldSpec, FieldTable};
pub use command_line::{command_line_source, parse_command_line, COMMAND_LINE_SOURCE_NAME};
pub use convert::{FromProperty, MapKey, PropertyValue};
pub use environment::{
    Environment, EnvironmentBuilder, StandardEnvironment, DEFAULT_APPLICATION_SOURCE_NAME,
    PROFILE_INCLUDE_KEY, RUN_INFO_SOURCE_NAME,
};
pub use event::{ChangeHandler, ChangeType, KeyChangeEvent, PropertyChangeListener};
pub use loader::{
    FilePropertyReader, PropertiesFileLoader, PropertiesLoader, PropertiesLoaders, TomlFileLoader,
    YamlFileLoader,
};
pub use polling::{FnPropertyReader, PollingPropertySource, PollingState, PropertyReader};
pub use resolver::{PropertyResolver, PropertySourcesPropertyResolver};
pub use run_info::{Detector, DetectorChain, Env, EnvAliases, RunInfo};
pub use source::{MapPropertySource, PropertySource};
pub use sources::{PropertySources, SourcesChangeType};
pub use system::{system_environment_source, SYSTEM_ENVIRONMENT_SOURCE_NAME};
