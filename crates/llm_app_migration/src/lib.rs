pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_conversation;
mod m20260301_000002_create_knowledge_chunk;
mod m20260301_000003_create_config_items;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_create_conversation::Migration),
            Box::new(m20260301_000002_create_knowledge_chunk::Migration),
            Box::new(m20260301_000003_create_config_items::Migration),
        ]
    }
}
