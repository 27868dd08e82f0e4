use anyhow::Result;
use contact_intake::utils::logging;
use contact_intake::{App, Config};
use std::path::Path;

/// 默认配置文件，可用 CONFIG_FILE 覆盖
const DEFAULT_CONFIG_FILE: &str = "contact_intake.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config_file =
        std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let config = Config::load(Path::new(&config_file))?;

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化并运行应用
    let stats = App::initialize(config).await?.run().await?;

    if stats.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
