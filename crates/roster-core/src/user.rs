//! # Directory Users
//!
//! The user record as the upstream directory returns it, plus the two
//! enumerations the rest of the system keys decisions on.

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Application role, mirrored into `app_metadata.role` upstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    Writer,
    Teacher,
    Learner,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Editor,
        Role::Writer,
        Role::Teacher,
        Role::Learner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Editor => "editor",
            Self::Writer => "writer",
            Self::Teacher => "teacher",
            Self::Learner => "learner",
        }
    }

    /// Seniority; a role covers every role of equal or lower rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Admin => 4,
            Self::Editor => 3,
            Self::Writer => 2,
            Self::Teacher => 1,
            Self::Learner => 0,
        }
    }

    pub fn covers(self, other: Role) -> bool {
        self.rank() >= other.rank()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub const ALL: [Gender; 3] = [Gender::Male, Gender::Female, Gender::Other];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| format!("unknown gender '{}'", s))
    }
}

/// One linked login identity (`provider|user_id` is its external id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub provider: String,
    pub user_id: String,
}

impl Identity {
    pub fn external_id(&self) -> String {
        format!("{}|{}", self.provider, self.user_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A user as stored by the upstream directory.
///
/// Attributes we do not model are kept in `extra` so a cached copy
/// round-trips without losing anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub logins_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub app_metadata: AppMetadata,
    #[serde(default)]
    pub user_metadata: UserMetadata,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl User {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let identities = user_id
            .split_once('|')
            .map(|(provider, id)| Identity {
                provider: provider.to_string(),
                user_id: id.to_string(),
            })
            .into_iter()
            .collect();
        Self {
            user_id,
            email: email.into(),
            given_name: None,
            family_name: None,
            email_verified: false,
            blocked: false,
            logins_count: 0,
            last_login: None,
            identities,
            app_metadata: AppMetadata::default(),
            user_metadata: UserMetadata::default(),
            extra: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.app_metadata.role
    }

    /// Every external id this user can be known by locally.
    pub fn external_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.identities.iter().map(Identity::external_id).collect();
        if !ids.contains(&self.user_id) {
            ids.push(self.user_id.clone());
        }
        ids
    }

    /// Whether the user's recorded date of birth puts them under fifteen on
    /// `today`. Users without a parsable date of birth are not under age.
    pub fn is_under_age(&self, today: NaiveDate) -> bool {
        self.user_metadata
            .date_of_birth
            .as_deref()
            .is_some_and(|dob| date_is_under_age(dob, today))
    }
}

/// `date_of_birth` accepts a plain `YYYY-MM-DD` date or an RFC 3339 timestamp.
pub fn date_is_under_age(date_of_birth: &str, today: NaiveDate) -> bool {
    let dob = NaiveDate::parse_from_str(date_of_birth, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(date_of_birth)
                .ok()
                .map(|dt| dt.date_naive())
        });
    match dob.and_then(|d| d.checked_add_months(Months::new(15 * 12))) {
        Some(fifteenth) => fifteenth > today,
        None => false,
    }
}

/// One page of upstream search results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserPage {
    #[serde(default)]
    pub users: Vec<User>,
    /// Matches for the query as a whole, not just this page.
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub limit: u64,
}

/// Attributes accepted by create and update calls. Absent fields are left
/// untouched upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_metadata: Option<AppMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<UserMetadata>,
}
