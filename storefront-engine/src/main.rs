use anyhow::Context;
use storefront_engine::{Config, EngineState, init_logger_with_file, print_banner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 设置环境 (dotenv, 日志)
    dotenv::dotenv().ok();
    let config = Config::from_env();
    let _log_guard = init_logger_with_file(Some(&config.log_level), config.log_dir.as_deref());

    print_banner();
    tracing::info!(work_dir = %config.work_dir, "Storefront engine starting");

    // 2. 初始化引擎状态
    let state = EngineState::initialize(&config)
        .await
        .context("failed to initialize engine state")?;

    // 3. 预热商品快照，启动后台任务
    state.warmup().await;
    let tasks = state.start_background_tasks();

    // 4. 等待退出信号
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if tasks.check_health() > 0 {
        tracing::warn!("Some background tasks had already stopped");
    }
    tasks.shutdown(config.shutdown_timeout()).await;
    tracing::info!("Storefront engine stopped");
    Ok(())
}
