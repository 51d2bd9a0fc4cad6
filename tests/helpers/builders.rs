use meridian::location::{EntityKind, Location};
use meridian::storage::{self, Client, ClientRole, NewClient, NewUser, User};
use sea_orm::DatabaseConnection;

/// Builder for creating test users
pub struct UserBuilder {
    username: String,
    password: String,
    scope: Vec<String>,
}

impl UserBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: "password123".to_string(),
            scope: Vec::new(),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn with_scope(mut self, scope: &[&str]) -> Self {
        self.scope = scope.iter().map(|s| s.to_string()).collect();
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> User {
        storage::create_user(
            db,
            NewUser {
                username: self.username,
                password: Some(self.password),
                scope: self.scope,
            },
        )
        .await
        .expect("Failed to create test user")
    }
}

/// Builder for creating test clients
pub struct ClientBuilder {
    client_id: String,
    client_secret: String,
    redirect_uri: Option<String>,
    roles: Vec<ClientRole>,
    scope: Vec<String>,
    default_user: Option<String>,
}

impl ClientBuilder {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: None,
            roles: vec![ClientRole::Consumer],
            scope: vec![".*".to_string()],
            default_user: None,
        }
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.client_secret = secret.to_string();
        self
    }

    pub fn with_redirect_uri(mut self, uri: &str) -> Self {
        self.redirect_uri = Some(uri.to_string());
        self
    }

    pub fn with_roles(mut self, roles: &[ClientRole]) -> Self {
        self.roles = roles.to_vec();
        self
    }

    pub fn with_scope(mut self, scope: &[&str]) -> Self {
        self.scope = scope.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_default_user(mut self, subject: &str) -> Self {
        self.default_user = Some(subject.to_string());
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> Client {
        storage::create_client(
            db,
            NewClient {
                client_id: Some(self.client_id),
                client_secret: Some(self.client_secret),
                client_name: Some("Test Client".to_string()),
                redirect_uri: self.redirect_uri,
                roles: self.roles,
                scope: self.scope,
                default_user: self.default_user,
            },
        )
        .await
        .expect("Failed to create test client")
    }
}

/// Builder for stored locations served by the `Redirect` driver
pub struct RedirectLocationBuilder {
    href: String,
    target: Option<String>,
    auth: Option<Vec<String>>,
    cache_expire_in: Option<i64>,
}

impl RedirectLocationBuilder {
    pub fn new(href: &str) -> Self {
        Self {
            href: href.to_string(),
            target: None,
            auth: None,
            cache_expire_in: None,
        }
    }

    pub fn to(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.auth = Some(groups.iter().map(|g| g.to_string()).collect());
        self
    }

    pub fn cache_expire_in(mut self, seconds: i64) -> Self {
        self.cache_expire_in = Some(seconds);
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> Location {
        let entity = storage::create_entity(
            db,
            &self.href,
            EntityKind::Redirect {
                target: self.target,
                permanent: false,
            },
            None,
        )
        .await
        .expect("Failed to create redirect entity");

        let mut location = Location::from_href(&self.href).expect("Invalid test href");
        location.driver = Some("Redirect".to_string());
        location.entity_id = Some(entity.id);
        location.auth = self.auth;
        location.cache_expire_in = self.cache_expire_in;
        storage::create_location(db, location)
            .await
            .expect("Failed to create test location")
    }
}
