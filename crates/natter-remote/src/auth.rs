use natter_types::models::UserIdentity;

/// Who is signed in right now.
///
/// Sends are stamped with the identity read at enqueue time; a `None`
/// here means sending is refused while reading stays available.
pub trait AuthProvider: Send + Sync {
    fn current_identity(&self) -> Option<UserIdentity>;
}

/// Fixed identity for sessions authenticated out of band.
pub struct StaticAuth {
    identity: Option<UserIdentity>,
}

impl StaticAuth {
    pub fn signed_in(id: &str, display_name: &str) -> Self {
        Self {
            identity: Some(UserIdentity {
                id: id.to_string(),
                display_name: display_name.to_string(),
            }),
        }
    }

    pub fn signed_out() -> Self {
        Self { identity: None }
    }
}

impl AuthProvider for StaticAuth {
    fn current_identity(&self) -> Option<UserIdentity> {
        self.identity.clone()
    }
}
