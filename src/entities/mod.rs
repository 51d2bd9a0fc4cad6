pub mod access_token;
pub mod auth_state;
pub mod cache_item;
pub mod client;
pub mod entity;
pub mod identity;
pub mod job_execution;
pub mod location;
pub mod resolver;
pub mod user;

pub use access_token::Entity as AccessToken;
pub use auth_state::Entity as AuthState;
pub use cache_item::Entity as CacheItem;
pub use client::Entity as Client;
pub use entity::Entity as ResourceEntity;
pub use identity::Entity as Identity;
pub use job_execution::Entity as JobExecution;
pub use location::Entity as Location;
pub use resolver::Entity as Resolver;
pub use user::Entity as User;
