use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_payment_transactions_table::Migration),
            Box::new(m20250301_000002_create_user_entitlements_table::Migration),
        ]
    }
}

// Migration implementations

mod m20250301_000001_create_payment_transactions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000001_create_payment_transactions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentTransactions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::Provider)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::ProviderTxId)
                                .text()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::MerchantOrderId)
                                .text()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentTransactions::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentTransactions::Amount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::State)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentTransactions::ReasonCode).integer().null())
                        .col(ColumnDef::new(PaymentTransactions::Plan).string_len(16).null())
                        .col(
                            ColumnDef::new(PaymentTransactions::DurationDays)
                                .integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::ProviderCreateTime)
                                .big_integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::RetryCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(PaymentTransactions::RawPayload).json().null())
                        .col(
                            ColumnDef::new(PaymentTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::PerformedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            // A provider's transaction id is unique within that provider
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_tx_provider_tx_id")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::Provider)
                        .col(PaymentTransactions::ProviderTxId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_tx_order_id")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::Provider)
                        .col(PaymentTransactions::MerchantOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_tx_user_state")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::UserId)
                        .col(PaymentTransactions::State)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentTransactions::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum PaymentTransactions {
        Table,
        Id,
        Provider,
        ProviderTxId,
        MerchantOrderId,
        UserId,
        Amount,
        State,
        ReasonCode,
        Plan,
        DurationDays,
        ProviderCreateTime,
        RetryCount,
        RawPayload,
        CreatedAt,
        PerformedAt,
        CancelledAt,
        UpdatedAt,
    }
}

mod m20250301_000002_create_user_entitlements_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000002_create_user_entitlements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(UserEntitlements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(UserEntitlements::UserId)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UserEntitlements::Plan)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UserEntitlements::ExpiryDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(UserEntitlements::ActivatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(UserEntitlements::Source).string_len(16).null())
                        .col(ColumnDef::new(UserEntitlements::DurationDays).integer().null())
                        .col(
                            ColumnDef::new(UserEntitlements::LastPaymentAmount)
                                .big_integer()
                                .null(),
                        )
                        .col(ColumnDef::new(UserEntitlements::PaymentStatus).text().null())
                        .col(
                            ColumnDef::new(UserEntitlements::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_entitlements_plan_expiry")
                        .table(UserEntitlements::Table)
                        .col(UserEntitlements::Plan)
                        .col(UserEntitlements::ExpiryDate)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(UserEntitlements::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum UserEntitlements {
        Table,
        UserId,
        Plan,
        ExpiryDate,
        ActivatedAt,
        Source,
        DurationDays,
        LastPaymentAmount,
        PaymentStatus,
        UpdatedAt,
    }
}
