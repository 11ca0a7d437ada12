use std::str::FromStr;

use axum::{
    extract::{Query, State},
    Json,
};
use bson::oid::ObjectId;
use mongodb::options::FindOptions;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::{is_duplicate_key_error, Collection},
    util::{FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::auth::{CurrentUser, Identity};

#[derive(Clone)]
pub struct UserCollection(pub Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub uid: String,
    pub email: String,
    pub name: String,

    #[serde(rename = "photoURL", default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    pub role: UserRole,
    pub status: AccountStatus,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
    pub last_login_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Rider,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Rider => "rider",
            UserRole::Admin => "admin",
        }
    }
}

impl FromStr for UserRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(UserRole::User),
            "rider" => Ok(UserRole::Rider),
            "admin" => Ok(UserRole::Admin),
            other => Err(Error::InvalidArgument(format!(
                "{} is not a valid role",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: ObjectIdString,

    pub uid: String,
    pub email: String,
    pub name: String,

    #[serde(rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    pub role: UserRole,
    pub status: AccountStatus,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
    pub last_login_at: FormattedDateTime,
}

impl From<UserModel> for UserResponse {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            uid: value.uid,
            email: value.email,
            name: value.name,
            photo_url: value.photo_url,
            provider: value.provider,
            role: value.role,
            status: value.status,

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
            last_login_at: value.last_login_at.into(),
        }
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[serde(rename = "photoURL", default)]
    pub photo_url: Option<String>,

    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub is_new_user: bool,
    pub id: ObjectIdString,
}

/// Upsert on verified login. A first login creates the account with the
/// default `user` role; later logins only refresh profile and login-time
/// fields, never `role`.
pub async fn login(
    State(users): State<UserCollection>,
    identity: Identity,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, Error> {
    request.validate()?;

    let existing = users
        .find_one(
            bson::doc! {
                "uid": &identity.uid,
            },
            None,
        )
        .await?;

    if let Some(existing) = existing {
        let now = bson::DateTime::from(OffsetDateTime::now_utc());

        users
            .update_one(
                bson::doc! { "_id": existing.id },
                bson::doc! {
                    "$set": {
                        "name": &request.name,
                        "photoURL": request.photo_url.clone(),
                        "provider": request.provider.clone(),
                        "updatedAt": now,
                        "lastLoginAt": now,
                    }
                },
                None,
            )
            .await?;

        return Ok(Json(LoginResponse {
            is_new_user: false,
            id: existing.id.into(),
        }));
    }

    let now = OffsetDateTime::now_utc();
    let model = UserModel {
        id: ObjectId::new(),
        uid: identity.uid,
        email: identity.email,
        name: request.name,
        photo_url: request.photo_url,
        provider: request.provider,
        role: UserRole::User,
        status: AccountStatus::Active,
        created_at: now.into(),
        updated_at: now.into(),
        last_login_at: now.into(),
    };

    if let Err(err) = users.insert_one(&model, None).await {
        // Two first logins racing: the unique index on uid decides.
        if is_duplicate_key_error(&err) {
            return Err(Error::Conflict("account already exists".to_string()));
        }
        return Err(err.into());
    }

    Ok(Json(LoginResponse {
        is_new_user: true,
        id: model.id.into(),
    }))
}

pub const SEARCH_LIMIT_MAX: i64 = 20;

#[derive(Deserialize, Debug, Clone)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SearchResponse {
    pub users: Vec<UserResponse>,
}

pub async fn search(
    State(users): State<UserCollection>,
    CurrentUser(acting): CurrentUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, Error> {
    match acting.role {
        UserRole::User | UserRole::Rider => {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("tried searching accounts without admin role"))
        }
        UserRole::Admin => {}
    }

    let q = query.q.trim();
    if q.len() < 2 {
        return Err(Error::InvalidArgument(
            "search query must be at least 2 characters".to_string(),
        ));
    }

    let limit = query.limit.unwrap_or(SEARCH_LIMIT_MAX).clamp(1, SEARCH_LIMIT_MAX);

    let regex = bson::Regex {
        pattern: q.to_string(),
        options: "i".to_string(),
    };

    let found = users
        .find_all(
            bson::doc! {
                "$or": [
                    { "email": { "$regex": regex.clone() } },
                    { "name": { "$regex": regex } },
                ]
            },
            FindOptions::builder()
                .sort(bson::doc! { "createdAt": -1 })
                .limit(limit)
                .build(),
        )
        .await?;

    Ok(Json(SearchResponse {
        users: found.into_iter().map(Into::into).collect(),
    }))
}

/// Self-lockout guard: an admin may change anyone's role, including their
/// own, except away from `admin` on their own account.
pub fn ensure_not_self_demotion(
    target_email: &str,
    acting_email: &str,
    new_role: UserRole,
) -> Result<(), Error> {
    if target_email == acting_email && new_role != UserRole::Admin {
        return Err(Error::InvalidOperation(
            "admins cannot demote their own account",
        ));
    }

    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChangeRoleRequest {
    pub role: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChangeRoleResponse {
    pub modified: bool,
}

pub async fn change_role(
    State(users): State<UserCollection>,
    CurrentUser(acting): CurrentUser,
    PathObjectId(target_id): PathObjectId,
    Json(request): Json<ChangeRoleRequest>,
) -> Result<Json<ChangeRoleResponse>, Error> {
    match acting.role {
        UserRole::User | UserRole::Rider => {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("tried changing role without admin role"))
        }
        UserRole::Admin => {}
    }

    let new_role = UserRole::from_str(&request.role)?;

    let target = users
        .find_one_by_id(target_id)
        .await?
        .ok_or(Error::NotFound("user"))?;

    ensure_not_self_demotion(&target.email, &acting.email, new_role)?;

    let result = users
        .update_one(
            bson::doc! { "_id": target_id },
            bson::doc! {
                "$set": {
                    "role": new_role.as_str(),
                    "updatedAt": bson::DateTime::from(OffsetDateTime::now_utc()),
                }
            },
            None,
        )
        .await?;

    Ok(Json(ChangeRoleResponse {
        modified: result.modified_count == 1,
    }))
}

pub async fn me(CurrentUser(user): CurrentUser) -> Result<Json<UserResponse>, Error> {
    Ok(Json(user.into()))
}
