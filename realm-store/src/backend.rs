use std::{
    collections::HashSet,
    fmt::{Debug, Display},
    hash::Hash,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Type alias for the backend user's ID.
pub type UserId<Backend> = <<Backend as AuthnBackend>::User as AuthUser>::Id;

/// A user which can be identified by the host's session layer.
///
/// # Examples
///
/// ```rust
/// use realm_store::AuthUser;
///
/// #[derive(Debug, Clone)]
/// struct User {
///     username: String,
///     pw_hash: Vec<u8>,
/// }
///
/// impl AuthUser for User {
///     type Id = String;
///
///     fn id(&self) -> Self::Id {
///         self.username.clone()
///     }
///
///     fn session_auth_hash(&self) -> &[u8] {
///         &self.pw_hash
///     }
/// }
/// ```
pub trait AuthUser: Debug + Clone + Send + Sync {
    /// An identifying feature of the user.
    type Id: Debug + Display + Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>;

    /// Returns some identifying feature of the user.
    fn id(&self) -> Self::Id;

    /// Returns a hash the host session uses to check the session is still
    /// valid.
    ///
    /// When this value changes, e.g. because the password was rotated,
    /// sessions established before the change should be rejected.
    fn session_auth_hash(&self) -> &[u8];
}

/// A backend which can authenticate users.
///
/// Backends must implement:
///
/// 1. [`authenticate`](AuthnBackend::authenticate), a method for authenticating
///    users with credentials and,
/// 2. [`get_user`](AuthnBackend::get_user) a method for getting a user by an
///    identifying feature.
#[async_trait]
pub trait AuthnBackend: Clone + Send + Sync {
    /// Authenticating user type.
    type User: AuthUser;

    /// Credential type used for authentication.
    type Credentials: Send + Sync;

    /// An error which can occur during authentication and authorization.
    type Error: std::error::Error + Send + Sync;

    /// Authenticates the given credentials with the backend.
    async fn authenticate(
        &self,
        creds: Self::Credentials,
    ) -> Result<Option<Self::User>, Self::Error>;

    /// Gets the user by provided ID from the backend.
    async fn get_user(&self, user_id: &UserId<Self>) -> Result<Option<Self::User>, Self::Error>;
}

/// A backend which can authorize users by role.
///
/// Backends without role support keep the default
/// [`get_roles`](AuthzBackend::get_roles), under which every user holds no
/// roles.
#[async_trait]
pub trait AuthzBackend
where
    Self: AuthnBackend,
{
    /// Role type.
    type Role: Hash + Eq + Send + Sync;

    /// Gets the roles held by the provided user.
    async fn get_roles(&self, _user: &Self::User) -> Result<HashSet<Self::Role>, Self::Error> {
        Ok(HashSet::new())
    }

    /// Returns a result which is `true` when the provided user holds the
    /// provided role and otherwise is `false`.
    async fn has_role(&self, user: &Self::User, role: Self::Role) -> Result<bool, Self::Error> {
        Ok(self.get_roles(user).await?.contains(&role))
    }

    /// Returns a result which is `true` when the provided user holds at least
    /// one of the provided roles.
    async fn has_any_role(
        &self,
        user: &Self::User,
        roles: Vec<Self::Role>,
    ) -> Result<bool, Self::Error> {
        let held = self.get_roles(user).await?;
        Ok(roles.iter().any(|role| held.contains(role)))
    }

    /// Returns a result which is `true` when the provided user holds all the
    /// provided roles and otherwise is `false`.
    async fn has_all_roles(
        &self,
        user: &Self::User,
        mut roles: Vec<Self::Role>,
    ) -> Result<bool, Self::Error> {
        if roles.is_empty() {
            return Ok(true);
        }

        if roles.len() == 1 {
            return self.has_role(user, roles.remove(0)).await;
        }

        let held = self.get_roles(user).await?;

        Ok(roles.iter().all(|role| held.contains(role)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestUser {
        name: String,
        pw_hash: Vec<u8>,
    }

    impl TestUser {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                pw_hash: vec![1, 2, 3, 4],
            }
        }
    }

    impl AuthUser for TestUser {
        type Id = String;

        fn id(&self) -> Self::Id {
            self.name.clone()
        }

        fn session_auth_hash(&self) -> &[u8] {
            &self.pw_hash
        }
    }

    #[derive(Clone, Default)]
    struct TestBackend {
        users: HashMap<String, TestUser>,
        roles: HashMap<String, HashSet<String>>,
    }

    impl TestBackend {
        fn add_user(&mut self, user: TestUser, roles: &[&str]) {
            self.roles.insert(
                user.name.clone(),
                roles.iter().map(|role| role.to_string()).collect(),
            );
            self.users.insert(user.name.clone(), user);
        }
    }

    #[async_trait]
    impl AuthnBackend for TestBackend {
        type User = TestUser;
        type Credentials = String; // Simplified for testing
        type Error = std::convert::Infallible;

        async fn authenticate(
            &self,
            name: Self::Credentials,
        ) -> Result<Option<Self::User>, Self::Error> {
            Ok(self.users.get(&name).cloned())
        }

        async fn get_user(
            &self,
            user_id: &UserId<Self>,
        ) -> Result<Option<Self::User>, Self::Error> {
            Ok(self.users.get(user_id).cloned())
        }
    }

    #[async_trait]
    impl AuthzBackend for TestBackend {
        type Role = String;

        async fn get_roles(
            &self,
            user: &Self::User,
        ) -> Result<HashSet<Self::Role>, Self::Error> {
            Ok(self.roles.get(&user.name).cloned().unwrap_or_default())
        }
    }

    #[derive(Clone)]
    struct RolelessBackend;

    #[async_trait]
    impl AuthnBackend for RolelessBackend {
        type User = TestUser;
        type Credentials = ();
        type Error = std::convert::Infallible;

        async fn authenticate(&self, _: ()) -> Result<Option<Self::User>, Self::Error> {
            Ok(None)
        }

        async fn get_user(&self, _: &UserId<Self>) -> Result<Option<Self::User>, Self::Error> {
            Ok(None)
        }
    }

    impl AuthzBackend for RolelessBackend {
        type Role = String;
    }

    #[tokio::test]
    async fn test_authenticate() {
        let user = TestUser::new("ferris");
        let mut backend = TestBackend::default();
        backend.add_user(user.clone(), &[]);

        let authenticated_user = backend.authenticate("ferris".to_string()).await.unwrap();
        assert_eq!(authenticated_user, Some(user));
    }

    #[tokio::test]
    async fn test_authenticate_failure() {
        let backend = TestBackend::default();

        assert!(backend
            .authenticate("ferris".to_string())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_get_user() {
        let user = TestUser::new("ferris");
        let mut backend = TestBackend::default();
        backend.add_user(user.clone(), &[]);

        let retrieved_user = backend.get_user(&"ferris".to_string()).await.unwrap();
        assert_eq!(retrieved_user, Some(user));
    }

    #[tokio::test]
    async fn test_has_role() {
        let user = TestUser::new("ferris");
        let mut backend = TestBackend::default();
        backend.add_user(user.clone(), &["editor"]);

        assert!(backend.has_role(&user, "editor".to_string()).await.unwrap());
        assert!(!backend.has_role(&user, "admin".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_any_role() {
        let user = TestUser::new("ferris");
        let mut backend = TestBackend::default();
        backend.add_user(user.clone(), &["editor"]);

        let roles = vec!["admin".to_string(), "editor".to_string()];
        assert!(backend.has_any_role(&user, roles).await.unwrap());

        let roles = vec!["admin".to_string()];
        assert!(!backend.has_any_role(&user, roles).await.unwrap());

        assert!(!backend.has_any_role(&user, vec![]).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_all_roles() {
        let user = TestUser::new("ferris");
        let mut backend = TestBackend::default();
        backend.add_user(user.clone(), &["editor", "admin"]);

        let roles = vec!["admin".to_string(), "editor".to_string()];
        assert!(backend.has_all_roles(&user, roles).await.unwrap());

        let roles = vec!["admin".to_string(), "owner".to_string()];
        assert!(!backend.has_all_roles(&user, roles).await.unwrap());

        assert!(backend.has_all_roles(&user, vec![]).await.unwrap());
    }

    #[tokio::test]
    async fn test_roleless_backend_holds_nothing() {
        let user = TestUser::new("ferris");
        let backend = RolelessBackend;

        assert!(backend.get_roles(&user).await.unwrap().is_empty());
        assert!(!backend.has_role(&user, "admin".to_string()).await.unwrap());
    }
}
