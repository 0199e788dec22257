use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_catalog_tables::Migration),
            Box::new(m20240601_000002_create_order_tables::Migration),
            Box::new(m20240601_000003_create_cancellation_tables::Migration),
        ]
    }
}

fn money(col: impl IntoIden) -> ColumnDef {
    ColumnDef::new(col)
        .decimal_len(12, 2)
        .not_null()
        .default(0)
        .to_owned()
}

mod m20240601_000001_create_catalog_tables {
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Products::SellerId).uuid().not_null())
                        .col(ColumnDef::new(Products::Title).string().not_null())
                        .col(ColumnDef::new(Products::Unit).string_len(20).not_null())
                        .col(money(Products::PricePerUnit))
                        .col(
                            ColumnDef::new(Products::QuantityAvailable)
                                .decimal_len(10, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::Pincode).string_len(10).not_null())
                        .col(
                            ColumnDef::new(Products::WeightPerUnitKg)
                                .decimal_len(10, 3)
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Products::IsPublished)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(DeliveryAddresses::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DeliveryAddresses::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(DeliveryAddresses::UserId).uuid().not_null())
                        .col(ColumnDef::new(DeliveryAddresses::Name).string().not_null())
                        .col(
                            ColumnDef::new(DeliveryAddresses::Phone)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryAddresses::AddressLine1)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(DeliveryAddresses::AddressLine2).string().null())
                        .col(ColumnDef::new(DeliveryAddresses::City).string().not_null())
                        .col(ColumnDef::new(DeliveryAddresses::State).string().not_null())
                        .col(
                            ColumnDef::new(DeliveryAddresses::Pincode)
                                .string_len(10)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryAddresses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PaymentModeCharges::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentModeCharges::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(PaymentModeCharges::PaymentMethod)
                                .string_len(20)
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(PaymentModeCharges::PlatformFeePercent)
                                .decimal_len(5, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PaymentModeCharges::GatewayFeePercent)
                                .decimal_len(5, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PaymentModeCharges::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentModeCharges::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(DeliveryAddresses::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        SellerId,
        Title,
        Unit,
        PricePerUnit,
        QuantityAvailable,
        Pincode,
        WeightPerUnitKg,
        IsPublished,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum DeliveryAddresses {
        Table,
        Id,
        UserId,
        Name,
        Phone,
        AddressLine1,
        AddressLine2,
        City,
        State,
        Pincode,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum PaymentModeCharges {
        Table,
        Id,
        PaymentMethod,
        PlatformFeePercent,
        GatewayFeePercent,
        IsActive,
    }
}

mod m20240601_000002_create_order_tables {
    use super::m20240601_000001_create_catalog_tables::{DeliveryAddresses, Products};
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Orders::Id)
                                .string_len(20)
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Orders::Uuid).uuid().not_null().unique_key())
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::DeliveryAddressId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Orders::PaymentStatus)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::PaymentMethod)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(money(Orders::Subtotal))
                        .col(money(Orders::ShippingCharges))
                        .col(money(Orders::DiscountAmount))
                        .col(money(Orders::TaxAmount))
                        .col(money(Orders::PlatformFee))
                        .col(money(Orders::GatewayFee))
                        .col(money(Orders::TotalAmount))
                        .col(ColumnDef::new(Orders::GatewayOrderId).string().null())
                        .col(ColumnDef::new(Orders::GatewayPaymentId).string().null())
                        .col(ColumnDef::new(Orders::GatewaySignature).string().null())
                        .col(ColumnDef::new(Orders::CarrierOrderId).string().null())
                        .col(ColumnDef::new(Orders::CarrierShipmentId).string().null())
                        .col(ColumnDef::new(Orders::AwbCode).string().null())
                        .col(ColumnDef::new(Orders::CourierId).string().null())
                        .col(ColumnDef::new(Orders::CourierName).string().null())
                        .col(ColumnDef::new(Orders::CarrierStatus).string().null())
                        .col(ColumnDef::new(Orders::Notes).text().null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_orders_delivery_address_id")
                                .from(Orders::Table, Orders::DeliveryAddressId)
                                .to(DeliveryAddresses::Table, DeliveryAddresses::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_gateway_order_id")
                        .table(Orders::Table)
                        .col(Orders::GatewayOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(OrderItems::OrderId).string_len(20).not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::SellerId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductName).string().not_null())
                        .col(ColumnDef::new(OrderItems::Unit).string_len(20).not_null())
                        .col(
                            ColumnDef::new(OrderItems::Quantity)
                                .decimal_len(10, 2)
                                .not_null(),
                        )
                        .col(money(OrderItems::UnitPrice))
                        .col(money(OrderItems::TotalPrice))
                        .col(
                            ColumnDef::new(OrderItems::ItemStatus)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_product_id")
                                .from(OrderItems::Table, OrderItems::ProductId)
                                .to(Products::Table, Products::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderStatusHistory::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderStatusHistory::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(OrderStatusHistory::OrderId)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderStatusHistory::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderStatusHistory::Title).string().not_null())
                        .col(ColumnDef::new(OrderStatusHistory::Message).text().not_null())
                        .col(
                            ColumnDef::new(OrderStatusHistory::ChangeSource)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderStatusHistory::ChangedBy).uuid().null())
                        .col(
                            ColumnDef::new(OrderStatusHistory::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_status_history_order_id")
                                .from(OrderStatusHistory::Table, OrderStatusHistory::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_status_history_order_id")
                        .table(OrderStatusHistory::Table)
                        .col(OrderStatusHistory::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderStatusHistory::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        Uuid,
        UserId,
        DeliveryAddressId,
        Status,
        PaymentStatus,
        PaymentMethod,
        Subtotal,
        ShippingCharges,
        DiscountAmount,
        TaxAmount,
        PlatformFee,
        GatewayFee,
        TotalAmount,
        GatewayOrderId,
        GatewayPaymentId,
        GatewaySignature,
        CarrierOrderId,
        CarrierShipmentId,
        AwbCode,
        CourierId,
        CourierName,
        CarrierStatus,
        Notes,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        SellerId,
        ProductName,
        Unit,
        Quantity,
        UnitPrice,
        TotalPrice,
        ItemStatus,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderStatusHistory {
        Table,
        Id,
        OrderId,
        Status,
        Title,
        Message,
        ChangeSource,
        ChangedBy,
        CreatedAt,
    }
}

mod m20240601_000003_create_cancellation_tables {
    use super::m20240601_000002_create_order_tables::Orders;
    use super::money;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_cancellation_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderCancellationRequests::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderCancellationRequests::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::OrderId)
                                .string_len(20)
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::UserId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::Reason)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::Description)
                                .text()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::RequestStatus)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(money(OrderCancellationRequests::RefundAmount))
                        .col(money(OrderCancellationRequests::GatewayFeeDeduction))
                        .col(money(OrderCancellationRequests::PlatformFeeDeduction))
                        .col(money(OrderCancellationRequests::FinalRefundAmount))
                        .col(
                            ColumnDef::new(OrderCancellationRequests::GatewayRefundId)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::ReviewedBy)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::AdminNotes)
                                .text()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::CarrierCancelled)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::CarrierResponse)
                                .text()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::RequestedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::ReviewedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::RefundProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OrderCancellationRequests::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cancellation_requests_order_id")
                                .from(
                                    OrderCancellationRequests::Table,
                                    OrderCancellationRequests::OrderId,
                                )
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderRefunds::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderRefunds::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(OrderRefunds::OrderId)
                                .string_len(20)
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(OrderRefunds::RefundType)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderRefunds::RefundStatus)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(money(OrderRefunds::RefundAmount))
                        .col(money(OrderRefunds::ProcessingFee))
                        .col(money(OrderRefunds::FinalRefundAmount))
                        .col(ColumnDef::new(OrderRefunds::Reason).text().not_null())
                        .col(
                            ColumnDef::new(OrderRefunds::EstimatedRefundDays)
                                .string_len(50)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderRefunds::InitiatedBy).uuid().null())
                        .col(
                            ColumnDef::new(OrderRefunds::InitiatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderRefunds::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_refunds_order_id")
                                .from(OrderRefunds::Table, OrderRefunds::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderRefunds::Table).to_owned())
                .await?;
            manager
                .drop_table(
                    Table::drop()
                        .table(OrderCancellationRequests::Table)
                        .to_owned(),
                )
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OrderCancellationRequests {
        Table,
        Id,
        OrderId,
        UserId,
        Reason,
        Description,
        RequestStatus,
        RefundAmount,
        GatewayFeeDeduction,
        PlatformFeeDeduction,
        FinalRefundAmount,
        GatewayRefundId,
        ReviewedBy,
        AdminNotes,
        CarrierCancelled,
        CarrierResponse,
        RequestedAt,
        ReviewedAt,
        RefundProcessedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderRefunds {
        Table,
        Id,
        OrderId,
        RefundType,
        RefundStatus,
        RefundAmount,
        ProcessingFee,
        FinalRefundAmount,
        Reason,
        EstimatedRefundDays,
        InitiatedBy,
        InitiatedAt,
        CompletedAt,
    }
}
