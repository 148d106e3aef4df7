//! Request-scoped identity derived from a validated session.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::AuthError, token::SessionClaims};

/// The built-in administrator account.
pub const ADMIN_USER_UID: &str = "USR000000000000000001";

/// Claim carrying the user's role.
pub const ROLE_CLAIM: &str = "role";

/// Claim carrying the user's display name.
pub const NAME_CLAIM: &str = "name";

/// User roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Platform administrator.
    SystemAdmin,
    /// Community moderator.
    Judgement,
    /// Regular member.
    OrdinaryUser,
    /// Paying member.
    Vip,
    /// Automated account.
    Robot,
}

impl Role {
    /// Wire name, as stored in the `role` claim.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemAdmin => "SYSTEM_ADMIN",
            Self::Judgement => "JUDGEMENT",
            Self::OrdinaryUser => "ORDINARY_USER",
            Self::Vip => "VIP",
            Self::Robot => "ROBOT",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYSTEM_ADMIN" => Ok(Self::SystemAdmin),
            "JUDGEMENT" => Ok(Self::Judgement),
            "ORDINARY_USER" => Ok(Self::OrdinaryUser),
            "VIP" => Ok(Self::Vip),
            "ROBOT" => Ok(Self::Robot),
            other => Err(AuthError::invalid_token_format(format!("unknown role '{other}'"))),
        }
    }
}

/// Who is making the request.
///
/// A context is logged in when it has both a user id and a role. The
/// `is_*` predicates answer `false` for anonymous callers; the `check_*`
/// variants fail with [`AuthError::NotLoggedIn`] first, then
/// [`AuthError::WrongUser`] for `*_for` forms, then
/// [`AuthError::AccessDenied`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionContext {
    uid: Option<String>,
    name: Option<String>,
    role: Option<Role>,
}

impl SessionContext {
    /// A caller without a session.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A human account.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AccessDenied`] for blank ids or names and for the
    /// robot role.
    pub fn human(
        uid: impl Into<String>,
        name: impl Into<String>,
        role: Role,
    ) -> Result<Self, AuthError> {
        let (uid, name) = (uid.into(), name.into());
        if uid.trim().is_empty() || name.trim().is_empty() {
            return Err(AuthError::access_denied("uid and name must not be blank"));
        }
        if role == Role::Robot {
            return Err(AuthError::access_denied("human user cannot hold the ROBOT role"));
        }
        Ok(Self { uid: Some(uid), name: Some(name), role: Some(role) })
    }

    /// An automated account.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AccessDenied`] for a blank id.
    pub fn robot(uid: impl Into<String>) -> Result<Self, AuthError> {
        let uid = uid.into();
        if uid.trim().is_empty() {
            return Err(AuthError::access_denied("uid must not be blank"));
        }
        Ok(Self { uid: Some(uid), name: None, role: Some(Role::Robot) })
    }

    /// Builds a context from validated claims.
    ///
    /// A missing `role` claim yields a context that is not logged in.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidTokenFormat`] for an unrecognised role.
    pub fn from_claims(claims: &SessionClaims) -> Result<Self, AuthError> {
        let role = claims.claim(ROLE_CLAIM).map(str::parse).transpose()?;
        Ok(Self {
            uid: Some(claims.sub.clone()).filter(|s| !s.trim().is_empty()),
            name: claims.claim(NAME_CLAIM).map(str::to_owned),
            role,
        })
    }

    /// User id, if any.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Display name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Role, if any.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    fn logged_in_role(&self) -> Option<Role> {
        self.uid.as_ref().and(self.role)
    }

    fn owns(&self, uid: &str) -> bool {
        self.uid.as_deref() == Some(uid)
    }

    /// Whether the caller has a session.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in_role().is_some()
    }

    /// Whether the caller is the built-in administrator account.
    #[must_use]
    pub fn is_manager(&self) -> bool {
        self.owns(ADMIN_USER_UID)
    }

    /// Whether the caller is logged in as `uid`.
    #[must_use]
    pub fn is_logged_in_for(&self, uid: &str) -> bool {
        self.is_logged_in() && self.owns(uid)
    }

    /// Whether the caller is a system administrator.
    #[must_use]
    pub fn is_system_admin(&self) -> bool {
        self.logged_in_role() == Some(Role::SystemAdmin)
    }

    /// Whether the caller is the system administrator `uid`.
    #[must_use]
    pub fn is_system_admin_for(&self, uid: &str) -> bool {
        self.owns(uid) && self.is_system_admin()
    }

    /// Whether the caller is an administrator or a robot.
    #[must_use]
    pub fn is_user_root(&self) -> bool {
        matches!(self.logged_in_role(), Some(Role::SystemAdmin | Role::Robot))
    }

    /// Whether the caller is the administrator or robot `uid`.
    #[must_use]
    pub fn is_user_root_for(&self, uid: &str) -> bool {
        self.owns(uid) && self.is_user_root()
    }

    /// Whether the caller is a person rather than an automated account.
    #[must_use]
    pub fn is_human_user(&self) -> bool {
        matches!(self.logged_in_role(), Some(role) if role != Role::Robot)
    }

    /// Whether the caller is the human user `uid`.
    #[must_use]
    pub fn is_human_user_for(&self, uid: &str) -> bool {
        self.owns(uid) && self.is_human_user()
    }

    /// Returns the caller's id.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`] for anonymous callers.
    pub fn check_logged_in(&self) -> Result<&str, AuthError> {
        match (self.uid.as_deref(), self.role) {
            (Some(uid), Some(_)) => Ok(uid),
            _ => Err(AuthError::NotLoggedIn),
        }
    }

    /// Fails unless the caller is logged in as `uid`.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`] or [`AuthError::WrongUser`].
    pub fn check_logged_in_for(&self, uid: &str) -> Result<(), AuthError> {
        let actual = self.check_logged_in()?;
        if actual != uid {
            return Err(AuthError::WrongUser { expected: uid.to_owned(), actual: actual.to_owned() });
        }
        Ok(())
    }

    /// Fails unless the caller is a system administrator.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`] or [`AuthError::AccessDenied`].
    pub fn check_system_admin(&self) -> Result<(), AuthError> {
        self.check_logged_in()?;
        self.require(self.is_system_admin(), "system administrator required")
    }

    /// Fails unless the caller is the system administrator `uid`.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`], [`AuthError::WrongUser`] or
    /// [`AuthError::AccessDenied`].
    pub fn check_system_admin_for(&self, uid: &str) -> Result<(), AuthError> {
        self.check_logged_in_for(uid)?;
        self.require(self.is_system_admin(), "system administrator required")
    }

    /// Fails unless the caller is an administrator or a robot.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`] or [`AuthError::AccessDenied`].
    pub fn check_user_root(&self) -> Result<(), AuthError> {
        self.check_logged_in()?;
        self.require(self.is_user_root(), "administrator or robot required")
    }

    /// Fails unless the caller is the administrator or robot `uid`.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`], [`AuthError::WrongUser`] or
    /// [`AuthError::AccessDenied`].
    pub fn check_user_root_for(&self, uid: &str) -> Result<(), AuthError> {
        self.check_logged_in_for(uid)?;
        self.require(self.is_user_root(), "administrator or robot required")
    }

    /// Fails unless the caller is a human user.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`] or [`AuthError::AccessDenied`].
    pub fn check_human_user(&self) -> Result<(), AuthError> {
        self.check_logged_in()?;
        self.require(self.is_human_user(), "human user required")
    }

    /// Fails unless the caller is the human user `uid`.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`], [`AuthError::WrongUser`] or
    /// [`AuthError::AccessDenied`].
    pub fn check_human_user_for(&self, uid: &str) -> Result<(), AuthError> {
        self.check_logged_in_for(uid)?;
        self.require(self.is_human_user(), "human user required")
    }

    fn require(&self, allowed: bool, reason: &str) -> Result<(), AuthError> {
        if allowed { Ok(()) } else { Err(AuthError::access_denied(reason)) }
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionContext[{}]", self.uid.as_deref().unwrap_or("anonymous"))
    }
}
