use uuid::Uuid;

/// The resolved caller identity for one request.
///
/// Resolved exactly once at the HTTP boundary and passed explicitly into every
/// component — no component re-derives identity from ambient request state.
/// A caller may be an authenticated user, an anonymous device (client-minted
/// `anon_id`), or neither (nothing to rate-limit or own anything against).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub anon_id: Option<String>,
    /// Tenant the request is scoped to. Always present: the authenticated
    /// user's org, or the default org for anonymous traffic.
    pub org_id: Uuid,
}

impl Identity {
    pub fn authenticated(user_id: Uuid, org_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            anon_id: None,
            org_id,
        }
    }

    pub fn anonymous(anon_id: impl Into<String>, org_id: Uuid) -> Self {
        Self {
            user_id: None,
            anon_id: Some(anon_id.into()),
            org_id,
        }
    }

    /// True when there is something to key retake limits and ownership on.
    pub fn is_resolvable(&self) -> bool {
        self.user_id.is_some() || self.anon_id.is_some()
    }

    /// Ownership check against an attempt's owner columns.
    /// An authenticated user owns attempts made under their user id; an
    /// anonymous caller owns attempts made under the same anon id. A caller
    /// with neither owns nothing.
    pub fn owns(&self, owner_user_id: Option<Uuid>, owner_anon_id: Option<&str>) -> bool {
        if let (Some(caller), Some(owner)) = (self.user_id, owner_user_id) {
            if caller == owner {
                return true;
            }
        }
        if let (Some(caller), Some(owner)) = (self.anon_id.as_deref(), owner_anon_id) {
            if caller == owner {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::Identity;
    use uuid::Uuid;

    #[test]
    fn resolvable_requires_user_or_anon() {
        let org = Uuid::now_v7();
        assert!(Identity::authenticated(Uuid::now_v7(), org).is_resolvable());
        assert!(Identity::anonymous("anon-1", org).is_resolvable());

        let neither = Identity {
            user_id: None,
            anon_id: None,
            org_id: org,
        };
        assert!(!neither.is_resolvable());
    }

    #[test]
    fn user_owns_own_attempt_only() {
        let org = Uuid::now_v7();
        let user = Uuid::now_v7();
        let identity = Identity::authenticated(user, org);

        assert!(identity.owns(Some(user), None));
        assert!(!identity.owns(Some(Uuid::now_v7()), None));
        assert!(!identity.owns(None, Some("anon-1")));
    }

    #[test]
    fn anon_owns_matching_anon_attempt() {
        let org = Uuid::now_v7();
        let identity = Identity::anonymous("anon-1", org);

        assert!(identity.owns(None, Some("anon-1")));
        assert!(!identity.owns(None, Some("anon-2")));
        assert!(!identity.owns(Some(Uuid::now_v7()), None));
    }

    #[test]
    fn empty_identity_owns_nothing() {
        let identity = Identity {
            user_id: None,
            anon_id: None,
            org_id: Uuid::now_v7(),
        };
        assert!(!identity.owns(Some(Uuid::now_v7()), Some("anon-1")));
    }
}
