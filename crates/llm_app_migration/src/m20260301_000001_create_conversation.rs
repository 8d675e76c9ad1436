use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 创建对话表
        manager
            .create_table(
                Table::create()
                    .table(Conversation::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Conversation::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Conversation::Corpus).string().not_null())
                    .col(ColumnDef::new(Conversation::UserName).string().not_null())
                    .col(ColumnDef::new(Conversation::Mode).string().not_null())
                    .col(ColumnDef::new(Conversation::Name).string().null())
                    .col(ColumnDef::new(Conversation::History).text().not_null())
                    .col(ColumnDef::new(Conversation::Metadata).text().not_null())
                    .col(
                        ColumnDef::new(Conversation::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Conversation::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Conversation::EndedAt).timestamp_with_time_zone().null())
                    .to_owned(),
            )
            .await?;

        // 按用户列出对话时使用
        manager
            .create_index(
                Index::create()
                    .name("idx_conversation_corpus_user")
                    .table(Conversation::Table)
                    .col(Conversation::Corpus)
                    .col(Conversation::UserName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Conversation::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Conversation {
    Table,
    Id,
    Corpus,
    UserName,
    Mode,
    Name,
    History,
    Metadata,
    CreatedAt,
    UpdatedAt,
    EndedAt,
}
