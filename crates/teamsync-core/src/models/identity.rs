use serde::{Deserialize, Serialize};

/// Profile snapshot of the signed-in user.
///
/// Replaced wholesale on login, shallow-merged by [`Identity::apply`] on
/// profile updates, and dropped on logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Identity {
    pub id: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

impl Identity {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }

    /// Shallow merge: every field present in `patch` replaces ours.
    pub fn apply(&mut self, patch: &IdentityPatch) {
        if let Some(ref v) = patch.first_name {
            self.first_name = v.clone();
        }
        if let Some(ref v) = patch.last_name {
            self.last_name = v.clone();
        }
        if let Some(ref v) = patch.username {
            self.username = v.clone();
        }
        if let Some(ref v) = patch.avatar {
            self.avatar = Some(v.clone());
        }
        if let Some(ref v) = patch.bio {
            self.bio = Some(v.clone());
        }
    }
}

/// Partial profile used by `update_user` and the update-profile mutation.
/// The id is not patchable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct IdentityPatch {
    #[serde(rename = "firstName", default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl IdentityPatch {
    pub fn bio(bio: impl Into<String>) -> Self {
        Self {
            bio: Some(bio.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.username.is_none()
            && self.avatar.is_none()
            && self.bio.is_none()
    }
}

/// Compact author/member reference embedded in other entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    #[serde(rename = "firstName", default)]
    pub first_name: String,
    #[serde(rename = "lastName", default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}
