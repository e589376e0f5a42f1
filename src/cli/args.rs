//! 命令行参数定义
//!
//! 使用clap定义应用程序的命令行接口

use crate::config::environment::StandardEnvironment;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

/// envkit - 分层配置环境查看工具
#[derive(Parser, Debug, Clone)]
#[command(
    name = "envkit",
    version = crate::VERSION,
    about = crate::APP_DESCRIPTION,
    long_about = None
)]
pub struct Args {
    /// 配置文件目录
    #[arg(
        short,
        long,
        value_name = "DIR",
        help = "配置文件目录，不存在时使用工作目录",
        env = "ENVKIT_CONFIG_DIR"
    )]
    pub config_dir: Option<PathBuf>,

    /// 运行环境
    #[arg(short, long, value_name = "ENV", help = "运行环境（dev/test/fat/prod）")]
    pub env: Option<String>,

    /// 部署集
    #[arg(long, value_name = "SET", help = "部署集")]
    pub set: Option<String>,

    /// 日志级别，未指定时使用配置中的 logging.level
    #[arg(
        short,
        long,
        value_enum,
        help = "日志级别",
        env = "ENVKIT_LOG_LEVEL"
    )]
    pub log_level: Option<LogLevel>,

    /// 额外激活的 profile
    #[arg(
        short,
        long,
        value_name = "PROFILE",
        value_delimiter = ',',
        help = "额外激活的 profile，逗号分隔"
    )]
    pub profiles: Vec<String>,

    /// 命令行配置项
    #[arg(
        short = 'D',
        long = "property",
        value_name = "KEY=VALUE",
        allow_hyphen_values = true,
        help = "命令行配置项，优先级最高"
    )]
    pub properties: Vec<String>,

    /// 忽略无法解析的嵌套占位符
    #[arg(long, help = "忽略无法解析的嵌套占位符")]
    pub ignore_unresolvable: bool,

    /// 不读取进程环境变量
    #[arg(long, help = "不读取进程环境变量")]
    pub no_system_env: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 日志级别枚举
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    /// 跟踪级别
    Trace,
    /// 调试级别
    Debug,
    /// 信息级别
    Info,
    /// 警告级别
    Warn,
    /// 错误级别
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// 子命令定义
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 查询配置值（解析占位符）
    Get {
        /// 配置 key
        #[arg(value_name = "KEY", help = "配置 key")]
        key: String,

        /// 配置不存在时的默认值
        #[arg(short, long, value_name = "VALUE", help = "配置不存在时的默认值，支持占位符")]
        default: Option<String>,

        /// 输出原始值
        #[arg(long, help = "输出原始值，不解析占位符")]
        raw: bool,
    },

    /// 解析文本中的占位符
    Resolve {
        /// 待解析文本
        #[arg(value_name = "TEXT", help = "待解析文本，如 'http://${host}:${port:80}'")]
        text: String,

        /// 无法解析的占位符视为错误
        #[arg(short, long, help = "无法解析的占位符视为错误")]
        required: bool,
    },

    /// 列出合并后的全部配置
    List {
        /// key 前缀
        #[arg(short, long, value_name = "PREFIX", help = "只列出以此前缀开头的 key")]
        prefix: Option<String>,

        /// 是否解析占位符
        #[arg(short, long, help = "解析占位符后输出")]
        resolved: bool,

        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: OutputFormat,
    },

    /// 查看运行信息、配置目录、profile 与配置来源
    Info {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: OutputFormat,
    },

    /// 轮询配置文件并输出配置变更，Ctrl+C 退出
    Watch {
        /// 轮询的配置文件
        #[arg(value_name = "FILE", help = "轮询的配置文件，优先级高于其他来源")]
        files: Vec<PathBuf>,

        /// 轮询间隔（秒）
        #[arg(
            short,
            long,
            value_name = "SECONDS",
            default_value = "5",
            help = "轮询间隔（秒）"
        )]
        interval: u64,

        /// 关注的 key 模式
        #[arg(short, long, value_name = "PATTERN", default_value = "*", help = "关注的 key 正则")]
        pattern: String,
    },
}

/// 输出格式枚举
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum OutputFormat {
    /// 文本格式
    Text,
    /// JSON格式
    Json,
    /// YAML格式
    Yaml,
}

impl Args {
    /// 解析命令行参数
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// 传给配置环境的命令行参数
    ///
    /// `--env`/`--set` 交给标准运行环境检测器，`-D key=value` 转换为 `--key=value`。
    pub fn environment_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(env) = &self.env {
            args.push(format!("--env={env}"));
        }
        if let Some(set) = &self.set {
            args.push(format!("--set={set}"));
        }
        for property in &self.properties {
            let property = property.trim_start_matches('-');
            if property.contains('=') {
                args.push(format!("--{property}"));
            } else {
                args.push(format!("--{property}=true"));
            }
        }
        args
    }

    /// 按命令行参数构建配置环境
    pub fn build_environment(&self) -> crate::Result<Arc<StandardEnvironment>> {
        let mut builder = StandardEnvironment::builder()
            .args(self.environment_args())
            .include_profiles(self.profiles.iter().cloned())
            .ignore_unresolvable_nested_placeholders(self.ignore_unresolvable)
            .system_environment(!self.no_system_env);
        if let Some(dir) = &self.config_dir {
            builder = builder.config_dir_for_all(dir);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_command() {
        let args = Args::try_parse_from([
            "envkit",
            "--env",
            "prod",
            "-D",
            "server.port=9090",
            "-D",
            "--debug",
            "-p",
            "redis,mysql",
            "get",
            "server.port",
            "--default",
            "8080",
        ])
        .unwrap();

        assert_eq!(args.profiles, vec!["redis", "mysql"]);
        assert_eq!(
            args.environment_args(),
            vec!["--env=prod", "--server.port=9090", "--debug=true"]
        );
        match args.command {
            Commands::Get { key, default, raw } => {
                assert_eq!(key, "server.port");
                assert_eq!(default.as_deref(), Some("8080"));
                assert!(!raw);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_watch_defaults() {
        let args = Args::try_parse_from(["envkit", "watch", "a.properties", "b.yaml"]).unwrap();
        match args.command {
            Commands::Watch {
                files,
                interval,
                pattern,
            } => {
                assert_eq!(files.len(), 2);
                assert_eq!(interval, 5);
                assert_eq!(pattern, "*");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(log::LevelFilter::from(LogLevel::Warn), log::LevelFilter::Warn);
        assert_eq!(LogLevel::Trace.to_string(), "trace");
    }
}
