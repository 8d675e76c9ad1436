use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use llm_app_entity::entities::{config_item, prelude::ConfigItem};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::config::Config;

/// 配置管理器，负责配置在数据库中的存取
#[derive(Clone)]
pub struct ConfigManager {
    db: Arc<DatabaseConnection>,
}

impl ConfigManager {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 从数据库加载配置，数据库中没有配置项时写入默认配置
    pub async fn load_config(&self) -> Result<Config> {
        match self.load_from_database().await? {
            Some(config) => {
                debug!("从数据库加载配置成功");
                Ok(config)
            }
            None => {
                info!("数据库中没有配置项，写入默认配置");
                let config = Config::default();
                self.save_config(&config).await?;
                Ok(config)
            }
        }
    }

    async fn load_from_database(&self) -> Result<Option<Config>> {
        let config_items: Vec<config_item::Model> = ConfigItem::find().all(self.db.as_ref()).await?;
        if config_items.is_empty() {
            return Ok(None);
        }

        let mut config_map: HashMap<String, Value> = HashMap::new();
        for item in config_items {
            let value: Value =
                serde_json::from_str(&item.value_json).with_context(|| format!("解析配置项 {} 失败", item.key_name))?;
            config_map.insert(item.key_name, value);
        }
        Self::build_config_from_map(config_map).map(Some)
    }

    /// 把扁平化的配置项叠加到默认配置上，缺失的键使用默认值，未知的键被忽略
    fn build_config_from_map(config_map: HashMap<String, Value>) -> Result<Config> {
        let mut nested_map = Map::new();
        for (key, value) in config_map {
            let parts: Vec<&str> = key.split('.').collect();
            Self::insert_nested(&mut nested_map, &parts, value);
        }

        let mut config_json = serde_json::to_value(Config::default())?;
        merge_json(&mut config_json, Value::Object(nested_map));

        serde_json::from_value(config_json).map_err(|e| {
            error!("配置反序列化失败: {}", e);
            anyhow!("从数据库数据构建配置对象失败: {}", e)
        })
    }

    /// 递归插入嵌套值
    fn insert_nested(map: &mut Map<String, Value>, parts: &[&str], value: Value) {
        let Some((key, remaining)) = parts.split_first() else {
            return;
        };
        if remaining.is_empty() {
            map.insert(key.to_string(), value);
            return;
        }

        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(nested) = entry {
            Self::insert_nested(nested, remaining, value);
        }
    }

    /// 将配置保存到数据库
    pub async fn save_config(&self, config: &Config) -> Result<()> {
        let config_json = serde_json::to_value(config)?;
        let config_map = Self::flatten_config_json(config_json)?;
        for (key, value) in config_map {
            self.update_config_item(&key, value).await?;
        }
        info!("配置已保存到数据库");
        Ok(())
    }

    /// 更新单个配置项
    pub async fn update_config_item(&self, key: &str, value: Value) -> Result<()> {
        let value_json = serde_json::to_string(&value)?;
        let existing = ConfigItem::find()
            .filter(config_item::Column::KeyName.eq(key))
            .one(self.db.as_ref())
            .await?;

        if let Some(existing_model) = existing {
            if existing_model.value_json == value_json {
                return Ok(());
            }
            let mut active_model: config_item::ActiveModel = existing_model.into();
            active_model.value_json = Set(value_json);
            active_model.updated_at = Set(Utc::now());
            active_model.update(self.db.as_ref()).await?;
        } else {
            let new_model = config_item::ActiveModel {
                key_name: Set(key.to_string()),
                value_json: Set(value_json),
                updated_at: Set(Utc::now()),
            };
            new_model.insert(self.db.as_ref()).await?;
        }

        debug!("配置项 {} 已更新", key);
        Ok(())
    }

    /// 获取单个配置项
    pub async fn get_config_item(&self, key: &str) -> Result<Option<Value>> {
        let config_item = ConfigItem::find()
            .filter(config_item::Column::KeyName.eq(key))
            .one(self.db.as_ref())
            .await?;

        match config_item {
            Some(item) => {
                let value: Value =
                    serde_json::from_str(&item.value_json).with_context(|| format!("解析配置项 {} 失败", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 扁平化为 `section.key` 形式的键值对，更深的嵌套作为整体 JSON 存储
    fn flatten_config_json(config_json: Value) -> Result<HashMap<String, Value>> {
        let Value::Object(sections) = config_json else {
            return Err(anyhow!("配置必须是JSON对象"));
        };

        let mut result = HashMap::new();
        for (section, value) in sections {
            match value {
                Value::Object(fields) => {
                    for (field, value) in fields {
                        result.insert(format!("{}.{}", section, field), value);
                    }
                }
                other => {
                    result.insert(section, other);
                }
            }
        }
        Ok(result)
    }
}

/// 把 overlay 中的对象字段逐层合并进 base
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::database::setup_test_database;

    #[test]
    fn test_flatten_and_rebuild() {
        let mut config = Config::default();
        config.llm.model = "gpt-4o".to_string();
        config.knowledge.website_urls = vec!["https://docs.rs/".to_string()];

        let flat = ConfigManager::flatten_config_json(serde_json::to_value(&config).unwrap()).unwrap();
        assert_eq!(flat["llm.model"], json!("gpt-4o"));
        assert_eq!(flat["server.bind_address"], json!("0.0.0.0:9090"));
        assert_eq!(flat["knowledge.website_urls"], json!(["https://docs.rs/"]));

        assert_eq!(ConfigManager::build_config_from_map(flat).unwrap(), config);
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let map = HashMap::from([
            ("llm.max_tokens".to_string(), json!(256)),
            ("llm.no_such_option".to_string(), json!(true)),
            ("legacy".to_string(), json!("ignored")),
        ]);
        let config = ConfigManager::build_config_from_map(map).unwrap();
        assert_eq!(config.llm.max_tokens, 256);
        assert_eq!(config.llm.model, "gpt-4");
        assert_eq!(config.knowledge, Config::default().knowledge);
    }

    #[test]
    fn test_invalid_value_is_error() {
        let map = HashMap::from([("llm.max_tokens".to_string(), json!("many"))]);
        assert!(ConfigManager::build_config_from_map(map).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let manager = ConfigManager::new(setup_test_database().await);

        // 首次加载写入默认配置
        let config = manager.load_config().await.unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(manager.get_config_item("llm.model").await.unwrap(), Some(json!("gpt-4")));

        manager.update_config_item("knowledge.num_documents", json!(5)).await.unwrap();
        let config = manager.load_config().await.unwrap();
        assert_eq!(config.knowledge.num_documents, 5);
        assert_eq!(manager.get_config_item("missing.key").await.unwrap(), None);
    }
}
