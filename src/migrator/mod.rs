use sea_orm_migration::prelude::*;

mod m20261001_000001_create_users_and_videos;
mod m20261001_000002_create_comments_and_likes;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000001_create_users_and_videos::Migration),
            Box::new(m20261001_000002_create_comments_and_likes::Migration),
        ]
    }
}
