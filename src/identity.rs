use nix::unistd::{Uid, User};
use std::path::PathBuf;

/// An account the lock can be released by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: Uid,
    pub home: PathBuf,
}

/// Errors resolving an account.
#[derive(Debug)]
pub enum IdentityError {
    Lookup { uid: Uid, source: nix::Error },
    Unknown { uid: Uid },
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Lookup { uid, source } => {
                write!(f, "failed to look up uid {uid}: {source}")
            }
            IdentityError::Unknown { uid } => write!(f, "no account for uid {uid}"),
        }
    }
}

impl std::error::Error for IdentityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IdentityError::Lookup { source, .. } => Some(source),
            IdentityError::Unknown { .. } => None,
        }
    }
}

impl Identity {
    /// Resolve the passwd entry for `uid`.
    pub fn from_uid(uid: Uid) -> Result<Self, IdentityError> {
        let user = User::from_uid(uid)
            .map_err(|e| IdentityError::Lookup { uid, source: e })?
            .ok_or(IdentityError::Unknown { uid })?;
        Ok(Self::from(user))
    }

    /// The administrator account (uid 0).
    pub fn administrator() -> Result<Self, IdentityError> {
        Self::from_uid(Uid::from_raw(0))
    }

    #[cfg(test)]
    pub fn is_administrator(&self) -> bool {
        self.uid.is_root()
    }
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid,
            home: user.dir,
        }
    }
}

/// The two accounts a locked session may be unlocked by.
#[derive(Debug, Clone)]
pub struct Identities {
    pub owner: Identity,
    pub administrator: Identity,
}

impl Identities {
    pub fn resolve(owner: Uid) -> Result<Self, IdentityError> {
        let owner = Identity::from_uid(owner)?;
        let administrator = Identity::administrator()?;
        tracing::debug!(
            owner = %owner.name,
            home = %owner.home.display(),
            admin = %administrator.name,
            "identities resolved"
        );
        Ok(Self {
            owner,
            administrator,
        })
    }

    /// Whether the terminal belongs to the administrator itself.
    pub fn owner_is_administrator(&self) -> bool {
        self.owner.uid == self.administrator.uid
    }
}
