use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(KnowledgeChunk::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(KnowledgeChunk::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(KnowledgeChunk::Collection).string().not_null())
                    .col(ColumnDef::new(KnowledgeChunk::DocumentName).string().not_null())
                    .col(ColumnDef::new(KnowledgeChunk::ChunkIndex).integer().not_null())
                    .col(ColumnDef::new(KnowledgeChunk::Content).text().not_null())
                    .col(ColumnDef::new(KnowledgeChunk::Embedding).text().not_null())
                    .col(ColumnDef::new(KnowledgeChunk::Metadata).text().not_null())
                    .col(
                        ColumnDef::new(KnowledgeChunk::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // 检索时按集合整体读取
        manager
            .create_index(
                Index::create()
                    .name("idx_knowledge_chunk_collection")
                    .table(KnowledgeChunk::Table)
                    .col(KnowledgeChunk::Collection)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(KnowledgeChunk::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum KnowledgeChunk {
    Table,
    Id,
    Collection,
    DocumentName,
    ChunkIndex,
    Content,
    Embedding,
    Metadata,
    CreatedAt,
}
