//! # Overview
//!
//! This crate provides a credential and role store for session-based
//! authentication, backed by an SQLite database whose table and column names
//! are configured per realm.
//!
//! It offers:
//!
//! - **User lookup and management:** Finding users by username, reset code
//!   or any column, creating them and updating their columns.
//! - **Password verification and rotation:** Salted SHA-2 hashes, last-login
//!   stamping and optional password expiry.
//! - **Roles discovered from the schema:** The link between users and roles
//!   is found from the join table's foreign keys rather than configured by
//!   hand. Roles can be listed, checked and replaced as a set.
//!
//! Hosts authenticate through the [`AuthnBackend`] and [`AuthzBackend`]
//! traits, which [`CredentialStore`] implements. Sessions, routing and
//! connection pooling stay with the host.
//!
//! # Example
//!
//! ```rust,no_run
//! use realm_store::{CredentialStore, RealmConfig};
//! use secrecy::SecretString;
//! use serde_json::json;
//! use sqlx::SqlitePool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = SqlitePool::connect("sqlite://users.db").await?;
//! let config = RealmConfig::from_value(json!({
//!     "users_source": "users",
//!     "roles_source": "roles",
//!     "roles_key": "roles",
//!     "user_valid_conditions": { "deleted": 0 },
//! }))?;
//!
//! let store = CredentialStore::new(pool, config);
//! store.init().await?;
//!
//! let password = SecretString::new("hunter42".to_string());
//! if let Some(user) = store.authenticate("ferris", &password).await? {
//!     println!("welcome back {}", user.username());
//! }
//!
//! store
//!     .update_user("ferris", json!({ "roles": { "admin": true } }).as_object().cloned().unwrap())
//!     .await?;
//! # Ok(())
//! # }
//! ```
#![warn(
    clippy::all,
    nonstandard_style,
    future_incompatible,
    missing_debug_implementations,
    missing_docs
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use backend::{AuthUser, AuthnBackend, AuthzBackend, UserId};
pub use config::{EntityKind, RealmConfig};
pub use error::{Error, Result};
pub use password::{Algorithm, PasswordHasher, SaltedDigest};
pub use store::{CredentialStore, Credentials, FindOptions, Lookup, UserRow};
pub use user::{format_timestamp, parse_timestamp, User};

mod backend;
pub mod config;
mod error;
mod password;
mod query;
pub mod schema;
mod store;
mod user;
