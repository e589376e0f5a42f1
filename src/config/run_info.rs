//! 运行环境信息模块
//!
//! 识别当前部署环境（dev/test/fat/prod）、部署集与工作目录。识别顺序：
//! 自定义运行信息 → 按指定顺序执行的自定义检测器 → 标准检测器（命令行参数、环境变量、默认 dev）。

use crate::config::command_line::command_line_property;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// 运行信息中环境的配置 key
pub const RUN_INFO_ENV_KEY: &str = "runInfo.env";
/// 运行信息中部署集的配置 key
pub const RUN_INFO_SET_KEY: &str = "runInfo.set";
/// 运行信息中工作目录的配置 key
pub const RUN_INFO_WORK_DIR_KEY: &str = "runInfo.workDir";

/// 部署环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    /// 开发
    #[default]
    Dev,
    /// 测试
    Test,
    /// 预发布
    Fat,
    /// 生产
    Prod,
}

impl Env {
    /// 环境名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Env::Dev => "dev",
            Env::Test => "test",
            Env::Fat => "fat",
            Env::Prod => "prod",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 自定义环境别名表，例如把 `staging`、`uat` 映射为 [`Env::Fat`]
#[derive(Debug, Clone, Default)]
pub struct EnvAliases {
    aliases: HashMap<String, Env>,
}

impl EnvAliases {
    /// 创建空的别名表
    pub fn new() -> Self {
        Self::default()
    }

    /// 定义别名，忽略大小写，空别名被忽略
    pub fn define(&mut self, alias: &str, env: Env) {
        let alias = alias.trim();
        if !alias.is_empty() {
            self.aliases.insert(alias.to_lowercase(), env);
        }
    }

    /// 解析环境名称，别名优先，无法识别时返回 [`Env::Dev`]
    pub fn parse(&self, name: &str) -> Env {
        let name = name.trim().to_lowercase();
        if let Some(env) = self.aliases.get(&name) {
            return *env;
        }
        match name.as_str() {
            "test" => Env::Test,
            "fat" | "staging" => Env::Fat,
            "prod" => Env::Prod,
            _ => Env::Dev,
        }
    }
}

/// 当前运行信息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunInfo {
    /// 当前运行环境
    pub env: Env,
    /// 部署集，如所在大区或部署集群标识，默认为空
    pub set: String,
    /// 应用工作目录
    pub work_dir: PathBuf,
    /// 部署平台附带的额外配置
    pub properties: HashMap<String, String>,
}

impl RunInfo {
    /// 创建运行信息
    pub fn new(env: Env, set: impl Into<String>) -> Self {
        Self {
            env,
            set: set.into(),
            ..Self::default()
        }
    }

    /// 指定工作目录
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// 是否开发环境
    pub fn is_dev(&self) -> bool {
        self.env == Env::Dev
    }

    /// 是否测试环境
    pub fn is_test(&self) -> bool {
        self.env == Env::Test
    }

    /// 是否预发布环境
    pub fn is_fat(&self) -> bool {
        self.env == Env::Fat
    }

    /// 是否生产环境
    pub fn is_prod(&self) -> bool {
        self.env == Env::Prod
    }

    /// 运行信息对应的配置项，包含部署平台额外配置以及 `runInfo.*` 三项
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut properties = self.properties.clone();
        properties.insert(RUN_INFO_ENV_KEY.to_string(), self.env.to_string());
        properties.insert(RUN_INFO_SET_KEY.to_string(), self.set.clone());
        properties.insert(
            RUN_INFO_WORK_DIR_KEY.to_string(),
            self.work_dir.display().to_string(),
        );
        properties
    }
}

impl fmt::Display for RunInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Env:{}, Set:{}, WorkDir:{}, props:{:?}",
            self.env,
            self.set,
            self.work_dir.display(),
            self.properties
        )
    }
}

/// 检测时可用的输入
#[derive(Debug, Clone, Copy)]
pub struct DetectContext<'a> {
    /// 命令行参数
    pub args: &'a [String],
    /// 环境别名表
    pub aliases: &'a EnvAliases,
}

type DetectFn = dyn Fn(&DetectContext<'_>) -> Option<RunInfo> + Send + Sync;

/// 运行环境检测器，返回 `None` 表示无法识别，交给下一个检测器
#[derive(Clone)]
pub struct Detector {
    name: String,
    detect: Arc<DetectFn>,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Detector {
    /// 创建检测器
    pub fn new<F>(name: impl Into<String>, detect: F) -> Self
    where
        F: Fn(&DetectContext<'_>) -> Option<RunInfo> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            detect: Arc::new(detect),
        }
    }

    /// 检测器名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 执行检测
    pub fn detect(&self, context: &DetectContext<'_>) -> Option<RunInfo> {
        (self.detect)(context)
    }

    /// 标准检测器：`--env=`/`--set=` 命令行参数优先，其次 `env`/`set` 环境变量，最后默认 dev
    pub fn standard() -> Self {
        Self::new("StandardDetector", |context| {
            if let Some(env) = command_line_property(context.args, "env") {
                let set = command_line_property(context.args, "set").unwrap_or_default();
                return Some(RunInfo::new(context.aliases.parse(&env), set));
            }

            if let Some(env) = std::env::var("env").ok().filter(|v| !v.is_empty()) {
                let set = std::env::var("set").unwrap_or_default();
                return Some(RunInfo::new(context.aliases.parse(&env), set));
            }

            Some(RunInfo::new(Env::Dev, ""))
        })
    }
}

/// 运行环境检测链
#[derive(Debug, Clone, Default)]
pub struct DetectorChain {
    custom_run_info: Option<RunInfo>,
    detectors: Vec<Detector>,
    order: Vec<String>,
}

impl DetectorChain {
    /// 创建空的检测链，仅包含标准检测器
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用自定义运行信息，设置后不再执行任何检测器
    pub fn custom_run_info(&mut self, run_info: RunInfo) {
        self.custom_run_info = Some(run_info);
    }

    /// 添加到自定义检测器列表最前
    pub fn add_first(&mut self, detector: Detector) {
        if !detector.name.is_empty() {
            self.detectors.insert(0, detector);
        }
    }

    /// 添加到自定义检测器列表最后
    pub fn add_last(&mut self, detector: Detector) {
        if !detector.name.is_empty() {
            self.detectors.push(detector);
        }
    }

    /// 指定检测器执行顺序，未列出的自定义检测器按添加顺序排在其后
    pub fn define_order<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order = names.into_iter().map(Into::into).collect();
    }

    /// 实际执行顺序，标准检测器总在最后
    pub fn ordered(&self) -> Vec<Detector> {
        let mut ordered: Vec<Detector> = Vec::with_capacity(self.detectors.len() + 1);
        for name in &self.order {
            ordered.extend(self.detectors.iter().filter(|d| &d.name == name).cloned());
        }
        ordered.extend(
            self.detectors
                .iter()
                .filter(|d| !self.order.contains(&d.name))
                .cloned(),
        );
        ordered.push(Detector::standard());
        ordered
    }

    /// 识别当前运行环境，未设置工作目录时使用进程当前目录
    pub fn detect(&self, context: &DetectContext<'_>) -> RunInfo {
        let mut info = self.custom_run_info.clone().unwrap_or_else(|| {
            self.ordered()
                .iter()
                .find_map(|detector| {
                    let info = detector.detect(context)?;
                    debug!("运行环境检测器[{}]识别成功: {}", detector.name, info);
                    Some(info)
                })
                .unwrap_or_default()
        });

        if info.work_dir.as_os_str().is_empty() {
            info.work_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_env_parsing_and_aliases() {
        let mut aliases = EnvAliases::new();
        assert_eq!(aliases.parse("PROD"), Env::Prod);
        assert_eq!(aliases.parse("unknown"), Env::Dev);

        aliases.define("uat", Env::Test);
        assert_eq!(aliases.parse("UAT"), Env::Test);
        assert_eq!(Env::Fat.to_string(), "fat");
    }

    #[test]
    #[serial]
    fn test_standard_detector_prefers_command_line() {
        std::env::set_var("env", "prod");
        let aliases = EnvAliases::new();
        let args = args(&["app", "--env=test", "--set=sg"]);
        let context = DetectContext {
            args: &args,
            aliases: &aliases,
        };

        let info = DetectorChain::new().detect(&context);
        std::env::remove_var("env");

        assert_eq!(info.env, Env::Test);
        assert_eq!(info.set, "sg");
        assert!(!info.work_dir.as_os_str().is_empty());
    }

    #[test]
    #[serial]
    fn test_standard_detector_falls_back_to_env_vars() {
        std::env::set_var("env", "fat");
        std::env::set_var("set", "asia");
        let aliases = EnvAliases::new();
        let context = DetectContext {
            args: &[],
            aliases: &aliases,
        };

        let info = DetectorChain::new().detect(&context);
        std::env::remove_var("env");
        std::env::remove_var("set");

        assert_eq!(info.env, Env::Fat);
        assert_eq!(info.set, "asia");
    }

    #[test]
    #[serial]
    fn test_custom_detectors_follow_declared_order() {
        let mut chain = DetectorChain::new();
        chain.add_last(Detector::new("never", |_| None));
        chain.add_last(Detector::new("cloud", |_| Some(RunInfo::new(Env::Prod, "cloud"))));
        chain.add_last(Detector::new("k8s", |_| Some(RunInfo::new(Env::Test, "k8s"))));
        chain.define_order(["k8s"]);

        let names: Vec<String> = chain.ordered().iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["k8s", "never", "cloud", "StandardDetector"]);

        let aliases = EnvAliases::new();
        let context = DetectContext {
            args: &[],
            aliases: &aliases,
        };
        assert_eq!(chain.detect(&context).set, "k8s");

        chain.custom_run_info(RunInfo::new(Env::Fat, "custom").with_work_dir("/srv/app"));
        let info = chain.detect(&context);
        assert_eq!(info.set, "custom");
        assert_eq!(info.work_dir, PathBuf::from("/srv/app"));
    }

    #[test]
    fn test_run_info_properties() {
        let mut info = RunInfo::new(Env::Prod, "eu").with_work_dir("/srv");
        info.properties.insert("platform".into(), "k8s".into());

        let properties = info.to_properties();
        assert_eq!(properties[RUN_INFO_ENV_KEY], "prod");
        assert_eq!(properties[RUN_INFO_SET_KEY], "eu");
        assert_eq!(properties[RUN_INFO_WORK_DIR_KEY], "/srv");
        assert_eq!(properties["platform"], "k8s");
        assert!(info.is_prod() && !info.is_dev());
    }
}
