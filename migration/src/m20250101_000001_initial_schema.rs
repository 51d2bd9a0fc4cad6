use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Locations: unique on href
        manager
            .create_table(
                Table::create()
                    .table(Locations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Locations::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Locations::Href)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string_null(Locations::Protocol))
                    .col(string_null(Locations::Host))
                    .col(integer_null(Locations::Port))
                    .col(string(Locations::Path))
                    .col(string_null(Locations::Hash))
                    .col(string_null(Locations::Search))
                    .col(string_null(Locations::Auth))
                    .col(string_null(Locations::Driver))
                    .col(string_null(Locations::EntityId))
                    .col(big_integer_null(Locations::ExpiresAt))
                    .col(big_integer_null(Locations::CacheExpireIn))
                    .col(big_integer(Locations::CreatedAt))
                    .col(big_integer(Locations::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_locations_expires")
                    .table(Locations::Table)
                    .col(Locations::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Resolvers: unique on (mount point, priority), discriminated by type
        manager
            .create_table(
                Table::create()
                    .table(Resolvers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Resolvers::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Resolvers::MountPoint))
                    .col(string(Resolvers::MountRegex))
                    .col(string(Resolvers::MountOptions))
                    .col(big_integer(Resolvers::Priority))
                    .col(string(Resolvers::ResolverType))
                    .col(
                        ColumnDef::new(Resolvers::IsRootResolver)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(string(Resolvers::Config))
                    .col(big_integer(Resolvers::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_resolvers_mount_priority")
                    .table(Resolvers::Table)
                    .col(Resolvers::MountPoint)
                    .col(Resolvers::Priority)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Entities: unique on source href, discriminated by type
        manager
            .create_table(
                Table::create()
                    .table(Entities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Entities::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Entities::SourceHref)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(Entities::EntityType))
                    .col(string(Entities::Data))
                    .col(string_null(Entities::UserSubject))
                    .col(big_integer(Entities::CreatedAt))
                    .col(big_integer(Entities::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // Users
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Subject)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Users::Username)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string_null(Users::PasswordHash))
                    .col(string(Users::Scope))
                    .col(
                        ColumnDef::new(Users::Disabled)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(Users::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Provider-linked identities
        manager
            .create_table(
                Table::create()
                    .table(Identities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Identities::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Identities::Subject))
                    .col(string(Identities::Provider))
                    .col(string(Identities::ProviderUserId))
                    .col(string(Identities::Profile))
                    .col(big_integer(Identities::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_identities_subject")
                            .from(Identities::Table, Identities::Subject)
                            .to(Users::Table, Users::Subject)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_identities_provider_user")
                    .table(Identities::Table)
                    .col(Identities::Provider)
                    .col(Identities::ProviderUserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Clients
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Clients::ClientId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Clients::ClientSecret))
                    .col(string_null(Clients::ClientName))
                    .col(string_null(Clients::RedirectUri))
                    .col(string(Clients::Roles))
                    .col(string(Clients::Scope))
                    .col(string_null(Clients::DefaultUser))
                    .col(big_integer(Clients::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Access tokens (bearer and refresh share one table)
        manager
            .create_table(
                Table::create()
                    .table(AccessTokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccessTokens::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(AccessTokens::TokenType))
                    .col(string(AccessTokens::Token))
                    .col(string(AccessTokens::Scope))
                    .col(string(AccessTokens::ClientId))
                    .col(string(AccessTokens::Subject))
                    .col(string_null(AccessTokens::LinkedToken))
                    .col(big_integer(AccessTokens::ExpiresAt))
                    .col(big_integer(AccessTokens::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_tokens_type_token")
                    .table(AccessTokens::Table)
                    .col(AccessTokens::TokenType)
                    .col(AccessTokens::Token)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_tokens_expires")
                    .table(AccessTokens::Table)
                    .col(AccessTokens::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Server-side authorization state (provider round trips and issued codes)
        manager
            .create_table(
                Table::create()
                    .table(AuthStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthStates::Code)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(AuthStates::Kind))
                    .col(string(AuthStates::ClientId))
                    .col(string_null(AuthStates::RedirectUri))
                    .col(string(AuthStates::Scope))
                    .col(string_null(AuthStates::Subject))
                    .col(string_null(AuthStates::Provider))
                    .col(string_null(AuthStates::ClientState))
                    .col(big_integer(AuthStates::CreatedAt))
                    .col(big_integer(AuthStates::ExpiresAt))
                    .to_owned(),
            )
            .await?;

        // Generic keyed cache
        manager
            .create_table(
                Table::create()
                    .table(CacheItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CacheItems::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(text(CacheItems::Value))
                    .col(big_integer(CacheItems::ExpiresAt))
                    .col(big_integer(CacheItems::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cache_items_expires")
                    .table(CacheItems::Table)
                    .col(CacheItems::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Background job bookkeeping
        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobExecutions::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(string_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CacheItems::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthStates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AccessTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Identities::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Entities::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Resolvers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Locations::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Locations {
    Table,
    Id,
    Href,
    Protocol,
    Host,
    Port,
    Path,
    Hash,
    Search,
    Auth,
    Driver,
    EntityId,
    ExpiresAt,
    CacheExpireIn,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Resolvers {
    Table,
    Id,
    MountPoint,
    MountRegex,
    MountOptions,
    Priority,
    ResolverType,
    IsRootResolver,
    Config,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Entities {
    Table,
    Id,
    SourceHref,
    EntityType,
    Data,
    UserSubject,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Subject,
    Username,
    PasswordHash,
    Scope,
    Disabled,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Identities {
    Table,
    Id,
    Subject,
    Provider,
    ProviderUserId,
    Profile,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Clients {
    Table,
    ClientId,
    ClientSecret,
    ClientName,
    RedirectUri,
    Roles,
    Scope,
    DefaultUser,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AccessTokens {
    Table,
    Id,
    TokenType,
    Token,
    Scope,
    ClientId,
    Subject,
    LinkedToken,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AuthStates {
    Table,
    Code,
    Kind,
    ClientId,
    RedirectUri,
    Scope,
    Subject,
    Provider,
    ClientState,
    CreatedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum CacheItems {
    Table,
    Key,
    Value,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
