use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20240601_000001_create_supplier_tokens_table::Migration)]
    }
}

mod m20240601_000001_create_supplier_tokens_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_supplier_tokens_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SupplierTokens::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SupplierTokens::Id)
                                .integer()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SupplierTokens::AccessToken).text().not_null())
                        .col(ColumnDef::new(SupplierTokens::RefreshToken).text().not_null())
                        .col(
                            ColumnDef::new(SupplierTokens::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SupplierTokens::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SupplierTokens::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SupplierTokens {
        Table,
        Id,
        AccessToken,
        RefreshToken,
        ExpiresAt,
        UpdatedAt,
    }
}
