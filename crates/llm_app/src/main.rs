mod api;
mod config;
mod conversation;
mod database;
mod knowledge;
mod llm;
mod storage;
mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::api::{http_server, AppState};
use crate::config::{reload_config, set_config, ConfigManager, ARGS};
use crate::database::setup_database;
use crate::utils::init_logger;

#[tokio::main]
async fn main() -> Result<()> {
    init_logger(&ARGS.log_level)?;
    info!("llm-app v{} 启动中", env!("CARGO_PKG_VERSION"));

    let db = setup_database(ARGS.database_url.as_deref()).await?;
    let mut config = ConfigManager::new(db.clone())
        .load_config()
        .await
        .context("加载配置失败")?;
    config.apply_args(&ARGS);
    set_config(config);

    let config = reload_config();
    if ARGS.openai_api_key.is_none() {
        info!("未设置 OPENAI_API_KEY，模型与向量化请求将会失败");
    }
    let state = Arc::new(AppState::new(db, &config, ARGS.openai_api_key.clone())?);

    if ARGS.load_knowledge {
        let state = state.clone();
        tokio::spawn(async move {
            state.load_all_knowledge().await;
        });
    }

    if let Err(e) = http_server(state, &config.server).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
