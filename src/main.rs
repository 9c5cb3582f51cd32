use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use sftpsync_lib::logging::init_logging;
use sftpsync_lib::SyncConfig;
use tracing::{error, info};

/// 把本地目录可恢复地同步到 SFTP 服务器
#[derive(Debug, Parser)]
#[command(name = "sftpsync", version, about)]
struct Cli {
    /// JSON 配置文件
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match SyncConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置加载失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log);

    match sftpsync_lib::run(&config).await {
        Ok(report) => {
            info!(
                "同步完成，耗时 {} 秒: 扫描 {} 个, 上传 {} 个, 覆盖 {} 个, 跳过 {} 个",
                report.duration().num_seconds(),
                report.files_scanned,
                report.uploaded,
                report.overwritten,
                report.skipped
            );
            if let Ok(json) = serde_json::to_string_pretty(&report) {
                println!("{}", json);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("同步失败: {}", e);
            ExitCode::FAILURE
        }
    }
}
