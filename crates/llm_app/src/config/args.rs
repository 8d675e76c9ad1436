use std::path::PathBuf;

use clap::Parser;
use once_cell::sync::Lazy;

pub static ARGS: Lazy<Args> = Lazy::new(Args::parse);

#[derive(Parser, Debug, Default)]
#[command(name = "llm-app", version, about)]
pub struct Args {
    /// 监听地址，覆盖配置中的 server.bind_address
    #[arg(long, env = "LLM_APP_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// 数据库地址，支持 sqlite:// 与 postgres://，默认使用配置目录下的 data.sqlite
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(short, long, env = "LLM_APP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "LLM_APP_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// 启动时加载（不重建）所有知识库
    #[arg(long, env = "LLM_APP_LOAD_KNOWLEDGE")]
    pub load_knowledge: bool,
}
