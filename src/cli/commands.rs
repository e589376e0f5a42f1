//! 命令处理逻辑
//!
//! 实现各种CLI命令的处理逻辑

use crate::cli::args::{Commands, OutputFormat};
use crate::config::convert::PropertyValue;
use crate::config::environment::{Environment, StandardEnvironment};
use crate::config::event::KeyChangeEvent;
use crate::config::loader::PropertiesLoaders;
use crate::config::polling::PollingPropertySource;
use crate::config::resolver::PropertyResolver;
use crate::config::run_info::RunInfo;
use crate::error::{EnvError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 命令处理器trait
#[async_trait]
pub trait Command: Send + Sync {
    /// 执行命令
    async fn execute(&self, environment: &Arc<StandardEnvironment>) -> Result<()>;
}

/// 根据子命令创建命令处理器
pub fn command_for(command: &Commands) -> Box<dyn Command> {
    match command.clone() {
        Commands::Get { key, default, raw } => Box::new(GetCommand { key, default, raw }),
        Commands::Resolve { text, required } => Box::new(ResolveCommand { text, required }),
        Commands::List {
            prefix,
            resolved,
            format,
        } => Box::new(ListCommand {
            prefix,
            resolved,
            format,
        }),
        Commands::Info { format } => Box::new(InfoCommand { format }),
        Commands::Watch {
            files,
            interval,
            pattern,
        } => Box::new(WatchCommand {
            files,
            interval: Duration::from_secs(interval),
            pattern,
        }),
    }
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| EnvError::Other(anyhow::Error::new(e)))
}

/// 查询命令
#[derive(Debug, Clone)]
pub struct GetCommand {
    /// 配置 key
    pub key: String,
    /// 默认值
    pub default: Option<String>,
    /// 是否输出原始值
    pub raw: bool,
}

impl GetCommand {
    /// 查询结果
    pub fn render(&self, environment: &StandardEnvironment) -> Result<String> {
        let value = if self.raw {
            environment.properties().get(&self.key).cloned()
        } else {
            environment.get_property(&self.key)?
        };

        match (value, &self.default) {
            (Some(value), _) => Ok(value),
            (None, Some(default)) => Ok(environment.resolve_nested_placeholders(default)?),
            (None, None) => Err(EnvError::Other(anyhow::anyhow!(
                "配置[{}]不存在",
                self.key
            ))),
        }
    }
}

#[async_trait]
impl Command for GetCommand {
    async fn execute(&self, environment: &Arc<StandardEnvironment>) -> Result<()> {
        println!("{}", self.render(environment)?);
        Ok(())
    }
}

/// 占位符解析命令
#[derive(Debug, Clone)]
pub struct ResolveCommand {
    /// 待解析文本
    pub text: String,
    /// 无法解析时是否报错
    pub required: bool,
}

impl ResolveCommand {
    /// 解析结果
    pub fn render(&self, environment: &StandardEnvironment) -> Result<String> {
        let resolved = if self.required {
            environment.resolve_required_placeholders(&self.text)?
        } else {
            environment.resolve_placeholders(&self.text)?
        };
        Ok(resolved)
    }
}

#[async_trait]
impl Command for ResolveCommand {
    async fn execute(&self, environment: &Arc<StandardEnvironment>) -> Result<()> {
        println!("{}", self.render(environment)?);
        Ok(())
    }
}

/// 配置列表命令
#[derive(Debug, Clone)]
pub struct ListCommand {
    /// key 前缀
    pub prefix: Option<String>,
    /// 是否解析占位符
    pub resolved: bool,
    /// 输出格式
    pub format: OutputFormat,
}

impl ListCommand {
    /// 合并后的配置，解析失败的配置保留原始值
    pub fn collect(&self, environment: &StandardEnvironment) -> BTreeMap<String, String> {
        let prefix = self.prefix.as_deref().unwrap_or_default();
        environment
            .properties()
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, raw)| {
                if !self.resolved {
                    return (key, raw);
                }
                match environment.resolve_nested_placeholders(&raw) {
                    Ok(value) => (key, value),
                    Err(e) => {
                        warn!("配置[{}]解析失败，输出原始值: {}", key, e);
                        (key, raw)
                    }
                }
            })
            .collect()
    }

    /// 按输出格式渲染
    pub fn render(&self, environment: &StandardEnvironment) -> Result<String> {
        let properties = self.collect(environment);
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&typed(properties))?),
            OutputFormat::Yaml => to_yaml(&typed(properties)),
            OutputFormat::Text => Ok(properties
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }
}

/// 结构化输出时按字面量推断配置值类型
fn typed(properties: BTreeMap<String, String>) -> BTreeMap<String, PropertyValue> {
    properties
        .into_iter()
        .map(|(key, value)| (key, PropertyValue::infer(&value)))
        .collect()
}

#[async_trait]
impl Command for ListCommand {
    async fn execute(&self, environment: &Arc<StandardEnvironment>) -> Result<()> {
        println!("{}", self.render(environment)?);
        Ok(())
    }
}

/// 配置来源概要
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    /// 来源名称
    pub name: String,
    /// 配置项数量
    pub size: usize,
}

/// 配置环境概要
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSummary {
    /// 运行信息
    pub run_info: RunInfo,
    /// 配置目录
    pub config_dir: PathBuf,
    /// 激活的 profile
    pub active_profiles: Vec<String>,
    /// 配置来源，按优先级从高到低
    pub sources: Vec<SourceSummary>,
}

impl EnvironmentSummary {
    /// 采集配置环境概要
    pub fn of(environment: &StandardEnvironment) -> Self {
        let sources = environment
            .property_sources()
            .snapshot()
            .iter()
            .map(|source| SourceSummary {
                name: source.name().to_string(),
                size: source.snapshot().len(),
            })
            .collect();

        Self {
            run_info: environment.run_info().clone(),
            config_dir: environment.config_dir().to_path_buf(),
            active_profiles: environment.active_profiles(),
            sources,
        }
    }
}

/// 环境信息命令
#[derive(Debug, Clone)]
pub struct InfoCommand {
    /// 输出格式
    pub format: OutputFormat,
}

impl InfoCommand {
    /// 按输出格式渲染
    pub fn render(&self, environment: &StandardEnvironment) -> Result<String> {
        let summary = EnvironmentSummary::of(environment);
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&summary)?),
            OutputFormat::Yaml => to_yaml(&summary),
            OutputFormat::Text => {
                let mut lines = vec![
                    format!("{} v{}", crate::APP_NAME, crate::VERSION),
                    format!("运行信息: {}", summary.run_info),
                    format!("配置目录: {}", summary.config_dir.display()),
                    format!("激活的profile: {}", summary.active_profiles.join(", ")),
                    "配置来源（优先级从高到低）:".to_string(),
                ];
                for (i, source) in summary.sources.iter().enumerate() {
                    lines.push(format!("  {}. {} ({}项)", i + 1, source.name, source.size));
                }
                Ok(lines.join("\n"))
            }
        }
    }
}

#[async_trait]
impl Command for InfoCommand {
    async fn execute(&self, environment: &Arc<StandardEnvironment>) -> Result<()> {
        println!("{}", self.render(environment)?);
        Ok(())
    }
}

/// 配置监听命令
#[derive(Debug, Clone)]
pub struct WatchCommand {
    /// 轮询的配置文件
    pub files: Vec<PathBuf>,
    /// 轮询间隔
    pub interval: Duration,
    /// 关注的 key 模式
    pub pattern: String,
}

impl WatchCommand {
    /// 为每个文件创建轮询配置源并以最高优先级加入配置环境
    ///
    /// # 返回
    /// * `Result<Vec<Arc<PollingPropertySource>>>` - 已加入的轮询配置源
    pub async fn attach(
        &self,
        environment: &Arc<StandardEnvironment>,
    ) -> Result<Vec<Arc<PollingPropertySource>>> {
        let loaders = PropertiesLoaders::default();
        let mut sources = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let reader = loaders.reader(file)?;
            let name = format!("file:{}", file.display());
            let source = PollingPropertySource::start(name, self.interval, Arc::new(reader)).await?;
            environment.property_sources().add_first(source.clone());
            sources.push(source);
        }
        Ok(sources)
    }
}

#[async_trait]
impl Command for WatchCommand {
    async fn execute(&self, environment: &Arc<StandardEnvironment>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<KeyChangeEvent>();
        Environment::subscribe(
            environment.as_ref(),
            &self.pattern,
            Arc::new(move |event: &KeyChangeEvent| {
                let _ = tx.send(event.clone());
            }),
        );

        let sources = self.attach(environment).await?;
        info!("开始监听配置变更，轮询文件{}个", sources.len());

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => println!(
                        "[{}] {}: [{}] -> [{}]",
                        event.change_type, event.key, event.old_value, event.new_value
                    ),
                    None => break,
                },
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("监听中断信号失败: {}", e);
                    }
                    break;
                }
            }
        }

        for source in sources {
            source.shutdown();
        }
        info!("停止监听配置变更");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::run_info::Env;
    use tempfile::TempDir;

    fn environment(dir: &TempDir, args: &[&str]) -> Arc<StandardEnvironment> {
        StandardEnvironment::builder()
            .config_dir_for_all(dir.path())
            .custom_run_info(RunInfo::new(Env::Test, "").with_work_dir(dir.path()))
            .system_environment(false)
            .args(args.iter().copied())
            .build()
            .unwrap()
    }

    #[test]
    fn test_get_command() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("application.properties"),
            "server.host=localhost\nserver.url=http://${server.host}:${server.port:80}\n",
        )
        .unwrap();
        let environment = environment(&dir, &["--server.port=9090"]);

        let get = |key: &str, default: Option<&str>, raw: bool| {
            GetCommand {
                key: key.to_string(),
                default: default.map(str::to_string),
                raw,
            }
            .render(&environment)
        };

        assert_eq!(get("server.url", None, false).unwrap(), "http://localhost:9090");
        assert_eq!(
            get("server.url", None, true).unwrap(),
            "http://${server.host}:${server.port:80}"
        );
        assert_eq!(get("missing", Some("${server.host}"), false).unwrap(), "localhost");
        assert!(get("missing", None, false).is_err());
    }

    #[test]
    fn test_resolve_command() {
        let dir = TempDir::new().unwrap();
        let environment = environment(&dir, &["--name=envkit"]);

        let lenient = ResolveCommand {
            text: "${name}-${missing}".to_string(),
            required: false,
        };
        assert_eq!(lenient.render(&environment).unwrap(), "envkit-${missing}");

        let strict = ResolveCommand {
            required: true,
            ..lenient
        };
        assert!(strict.render(&environment).is_err());
    }

    #[test]
    fn test_list_command() {
        let dir = TempDir::new().unwrap();
        let environment = environment(
            &dir,
            &["--db.host=h", "--db.port=5432", "--db.url=jdbc://${db.host}", "--other=1"],
        );

        let list = ListCommand {
            prefix: Some("db.".to_string()),
            resolved: true,
            format: OutputFormat::Text,
        };
        assert_eq!(list.render(&environment).unwrap(), "db.host=h\ndb.port=5432\ndb.url=jdbc://h");

        let json = ListCommand {
            format: OutputFormat::Json,
            resolved: false,
            ..list
        };
        let parsed: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&json.render(&environment).unwrap()).unwrap();
        assert_eq!(parsed["db.url"], "jdbc://${db.host}");
        assert_eq!(parsed["db.port"], 5432);
        assert!(!parsed.contains_key("other"));
    }

    #[test]
    fn test_info_command() {
        let dir = TempDir::new().unwrap();
        let environment = environment(&dir, &[]);

        let summary = EnvironmentSummary::of(&environment);
        assert_eq!(summary.run_info.env, Env::Test);
        assert_eq!(summary.sources[0].name, crate::config::COMMAND_LINE_SOURCE_NAME);

        let text = InfoCommand {
            format: OutputFormat::Text,
        }
        .render(&environment)
        .unwrap();
        assert!(text.contains("配置来源"));

        let yaml = InfoCommand {
            format: OutputFormat::Yaml,
        }
        .render(&environment)
        .unwrap();
        assert!(yaml.contains("run_info"));
    }

    #[tokio::test]
    async fn test_watch_attach_adds_highest_precedence_source() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("override.properties");
        std::fs::write(&file, "server.port=7070\n").unwrap();
        let environment = environment(&dir, &["--server.port=9090"]);

        let watch = WatchCommand {
            files: vec![file.clone()],
            interval: Duration::ZERO,
            pattern: "*".to_string(),
        };
        let sources = watch.attach(&environment).await.unwrap();

        assert_eq!(sources.len(), 1);
        assert_eq!(
            environment.property_sources().names()[0],
            format!("file:{}", file.display())
        );
        assert_eq!(
            environment.get_property("server.port").unwrap().as_deref(),
            Some("7070")
        );
    }
}
