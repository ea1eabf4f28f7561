//! Caller identity supplied by the authentication layer in front of the engine.

/// The authenticated principal of a request, if any. Used only for attribution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub principal: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Identity::default()
    }

    pub fn user(principal: impl Into<String>) -> Self {
        Identity {
            principal: Some(principal.into()),
        }
    }
}
