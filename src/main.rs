use clap::Parser;
use meridian::storage::{self, ClientRole, NewClient, NewUser};
use meridian::{jobs, settings, web};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "meridian", version, about = "Resource resolution gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

const BOOTSTRAP_CLIENT_ID: &str = "meridian-bootstrap";

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    let root = storage::ensure_root_resolver(&db).await?;
    tracing::info!(resolver = %root.id, "Root resolver ready");

    ensure_bootstrap_principals(&db).await?;

    let _scheduler = jobs::init_scheduler(db.clone()).await?;

    let state = web::AppState::new(settings, db)?;
    web::serve(state).await
}

/// Seed an `admin` user and a consumer client able to mint tokens for it.
async fn ensure_bootstrap_principals(db: &sea_orm::DatabaseConnection) -> Result<()> {
    let admin = match storage::get_user_by_username(db, "admin")
        .await
        .into_diagnostic()?
    {
        Some(admin) => admin,
        None => {
            let password = std::env::var("MERIDIAN_ADMIN_PASSWORD").unwrap_or_else(|_| storage::random_id());
            let admin = storage::create_user(
                db,
                NewUser {
                    username: "admin".to_string(),
                    password: Some(password.clone()),
                    scope: vec![".*".to_string()],
                },
            )
            .await
            .into_diagnostic()?;
            tracing::info!(username = "admin", %password, "Created admin user");
            admin
        }
    };

    if storage::get_client(db, BOOTSTRAP_CLIENT_ID)
        .await
        .into_diagnostic()?
        .is_none()
    {
        let client = storage::create_client(
            db,
            NewClient {
                client_id: Some(BOOTSTRAP_CLIENT_ID.to_string()),
                client_name: Some("Bootstrap consumer".to_string()),
                roles: vec![ClientRole::Consumer],
                scope: vec![".*".to_string()],
                default_user: Some(admin.subject),
                ..Default::default()
            },
        )
        .await
        .into_diagnostic()?;
        tracing::info!(
            client_id = %client.client_id,
            client_secret = %client.client_secret,
            "Created bootstrap client"
        );
    }
    Ok(())
}
