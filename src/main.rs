//! envkit 主程序入口
//!
//! 查看分层配置环境：查询、解析、列出配置以及监听配置变更

use anyhow::{Context, Result};
use clap::Parser;
use envkit::cli::args::Args;
use envkit::cli::commands::command_for;
use envkit::logging::{LoggingProperties, LoggingSystem, TraceContext};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 构建配置环境
    let environment = args.build_environment().context("构建配置环境失败")?;

    // 初始化日志系统，命令行指定的级别优先
    let mut log_config = LoggingProperties::from_environment(&environment)
        .context("绑定日志配置失败")?
        .to_log_config();
    if let Some(level) = args.log_level {
        log_config.level = level.into();
    }
    let _logging_system = LoggingSystem::setup_logging(log_config).context("初始化日志系统失败")?;
    if args.log_level.is_none() {
        LoggingSystem::watch_environment(&environment);
    }

    let context = TraceContext::new();
    info!("envkit v{} 启动, trace_id: {}", envkit::VERSION, context.trace_id());

    // 执行命令
    let command = command_for(&args.command);
    if let Err(e) = context.scope(command.execute(&environment)).await {
        error!("命令执行失败: {}", e);
        eprintln!("{e}");
        std::process::exit(1);
    }

    Ok(())
}
