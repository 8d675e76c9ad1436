use sea_orm::entity::prelude::*;

/// 对话记录实体
///
/// `history` 与 `metadata` 以 JSON 文本存储，每轮对话整体覆盖写入
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "conversation")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 所属知识库（pdf / arxiv / website）
    pub corpus: String,
    pub user_name: String,
    /// 对话模式（RAG / AUTO），创建后不可更改
    pub mode: String,
    pub name: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub history: String,
    #[sea_orm(column_type = "Text")]
    pub metadata: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
