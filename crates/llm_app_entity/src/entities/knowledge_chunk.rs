use sea_orm::entity::prelude::*;

/// 知识库文档分块，附带向量
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "knowledge_chunk")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 向量集合名称，例如 pdf_documents
    pub collection: String,
    pub document_name: String,
    pub chunk_index: i32,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    /// JSON 数组形式的 f32 向量
    #[sea_orm(column_type = "Text")]
    pub embedding: String,
    #[sea_orm(column_type = "Text")]
    pub metadata: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
