use sqlx::migrate::Migrator;

/// 内嵌的数据库迁移脚本
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
