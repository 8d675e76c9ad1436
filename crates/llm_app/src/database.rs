use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use llm_app_migration::{Migrator, MigratorTrait};
use sea_orm::sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, SqlxSqliteConnector};
use tracing::{debug, info};

use crate::config::CONFIG_DIR;

fn default_database_url() -> Result<String> {
    if !CONFIG_DIR.exists() {
        std::fs::create_dir_all(&*CONFIG_DIR).context("创建配置目录失败")?;
    }
    Ok(format!("sqlite://{}?mode=rwc", CONFIG_DIR.join("data.sqlite").display()))
}

/// 创建 SQLite 连接选项
fn create_sqlite_options(url: &str) -> Result<SqliteConnectOptions> {
    Ok(SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30))
        .pragma("cache_size", "-65536")
        .pragma("temp_store", "MEMORY"))
}

async fn database_connection(url: &str) -> Result<DatabaseConnection> {
    if url.starts_with("sqlite:") {
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(create_sqlite_options(url)?)
            .await?;
        debug!("SQLite 连接池已创建（WAL 模式）");
        return Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool));
    }

    let mut options = ConnectOptions::new(url.to_string());
    options
        .max_connections(16)
        .connect_timeout(Duration::from_secs(30))
        .sqlx_logging(false);
    Ok(Database::connect(options).await?)
}

/// 进行数据库迁移并获取数据库连接，`url` 为空时使用配置目录下的 SQLite
pub async fn setup_database(url: Option<&str>) -> Result<Arc<DatabaseConnection>> {
    let url = match url {
        Some(url) => url.to_string(),
        None => default_database_url()?,
    };
    let connection = database_connection(&url)
        .await
        .with_context(|| format!("连接数据库 {} 失败", redact(&url)))?;
    Migrator::up(&connection, None).await.context("数据库迁移失败")?;
    info!("数据库 {} 已就绪", redact(&url));

    Ok(Arc::new(connection))
}

/// 日志中隐藏连接串里的密码
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.find(':') {
                Some(colon) => format!("{}***{}", &url[..scheme_end + 3 + colon + 1], &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

/// 已迁移的内存数据库
#[cfg(test)]
pub(crate) async fn setup_test_database() -> Arc<DatabaseConnection> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(SqliteConnectOptions::from_str("sqlite::memory:").unwrap())
        .await
        .unwrap();
    let connection = SqlxSqliteConnector::from_sqlx_sqlite_pool(pool);
    Migrator::up(&connection, None).await.unwrap();
    Arc::new(connection)
}
