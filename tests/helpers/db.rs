use meridian::storage::{self, AccessToken, TokenType};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied and the root resolver in place
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");
        storage::ensure_root_resolver(&connection)
            .await
            .expect("Failed to create root resolver");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Store a live bearer token for `subject` carrying `scope`.
pub async fn seed_bearer(db: &DatabaseConnection, subject: &str, scope: &[&str]) -> AccessToken {
    let scope: Vec<String> = scope.iter().map(|s| s.to_string()).collect();
    storage::insert_token(db, TokenType::Bearer, "test-client", subject, &scope, 3600, None)
        .await
        .expect("Failed to create test token")
}
