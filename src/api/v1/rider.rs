use axum::{
    extract::{Query, State},
    Json,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::{is_duplicate_key_error, Collection, Paginated, Pagination},
    util::{now_iso, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{
    auth::{CurrentUser, Identity},
    user::{UserCollection, UserRole},
};

#[derive(Clone)]
pub struct RiderCollection(pub Collection<RiderModel>);

impl std::ops::Deref for RiderCollection {
    type Target = Collection<RiderModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RiderModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub phone: String,
    pub nid: String,

    pub created_by: CreatedBy,

    pub status: RiderStatus,

    #[serde(rename = "createdAtISO")]
    pub created_at_iso: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<bson::DateTime>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreatedBy {
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiderStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Deactivated,
}

impl RiderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiderStatus::Pending => "pending",
            RiderStatus::Approved => "approved",
            RiderStatus::Rejected => "rejected",
            RiderStatus::Deactivated => "deactivated",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RiderResponse {
    pub id: ObjectIdString,

    pub name: String,
    pub phone: String,
    pub nid: String,

    pub created_by: CreatedBy,
    pub status: RiderStatus,

    #[serde(rename = "createdAtISO")]
    pub created_at_iso: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<FormattedDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<FormattedDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<FormattedDateTime>,
}

impl From<RiderModel> for RiderResponse {
    fn from(value: RiderModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            phone: value.phone,
            nid: value.nid,
            created_by: value.created_by,
            status: value.status,
            created_at_iso: value.created_at_iso,
            approved_at: value.approved_at.map(Into::into),
            rejected_at: value.rejected_at.map(Into::into),
            deactivated_at: value.deactivated_at.map(Into::into),
        }
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(length(min = 6, max = 20))]
    pub phone: String,

    #[validate(length(min = 8, max = 20))]
    pub nid: String,
}

/// A caller applies to become a rider. Phone and NID are globally unique
/// across the whole registry, no matter which status the earlier
/// application ended in.
pub async fn apply(
    State(riders): State<RiderCollection>,
    identity: Identity,
    Json(request): Json<ApplyRequest>,
) -> Result<Json<RiderResponse>, Error> {
    request.validate()?;

    let count = riders
        .count_documents(
            bson::doc! {
                "$or": [
                    { "phone": &request.phone },
                    { "nid": &request.nid },
                ]
            },
            None,
        )
        .await?;

    if count > 0 {
        return Err(Error::Conflict(
            "a rider application with this phone or nid already exists".to_string(),
        ));
    }

    let model = RiderModel {
        id: ObjectId::new(),
        name: request.name,
        phone: request.phone,
        nid: request.nid,
        created_by: CreatedBy {
            email: identity.email,
        },
        status: RiderStatus::Pending,
        created_at_iso: now_iso(),
        approved_at: None,
        rejected_at: None,
        deactivated_at: None,
    };

    if let Err(err) = riders.insert_one(&model, None).await {
        // A concurrent application slipping past the count check lands on
        // the unique phone/nid index.
        if is_duplicate_key_error(&err) {
            return Err(Error::Conflict(
                "a rider application with this phone or nid already exists".to_string(),
            ));
        }
        return Err(err.into());
    }

    Ok(Json(model.into()))
}

fn ensure_admin(role: UserRole) -> Result<(), Error> {
    match role {
        UserRole::User | UserRole::Rider => Err(Error::Forbidden),
        UserRole::Admin => Ok(()),
    }
}

pub async fn pending(
    State(riders): State<RiderCollection>,
    CurrentUser(acting): CurrentUser,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Paginated<RiderResponse>>, Error> {
    ensure_admin(acting.role)
        .tap_err(|_| tracing::debug!("tried listing pending riders without admin role"))?;

    let page = riders
        .paginate(
            bson::doc! { "status": RiderStatus::Pending.as_str() },
            bson::doc! { "createdAtISO": -1 },
            &pagination,
        )
        .await?;

    Ok(Json(page.map(Into::into)))
}

#[derive(Deserialize, Debug, Clone)]
pub struct ActiveQuery {
    pub page: Option<u64>,
    pub limit: Option<i64>,
    pub search: Option<String>,
}

impl ActiveQuery {
    fn pagination(&self) -> Pagination {
        Pagination {
            page: self.page,
            limit: self.limit,
        }
    }
}

pub async fn active(
    State(riders): State<RiderCollection>,
    CurrentUser(acting): CurrentUser,
    Query(query): Query<ActiveQuery>,
) -> Result<Json<Paginated<RiderResponse>>, Error> {
    ensure_admin(acting.role)
        .tap_err(|_| tracing::debug!("tried listing active riders without admin role"))?;

    let mut filter = bson::doc! { "status": RiderStatus::Approved.as_str() };

    if let Some(search) = query.search.as_deref().map(str::trim).filter(|it| !it.is_empty()) {
        let regex = bson::Regex {
            pattern: search.to_string(),
            options: "i".to_string(),
        };
        filter.insert(
            "$or",
            vec![
                bson::doc! { "name": { "$regex": regex.clone() } },
                bson::doc! { "phone": { "$regex": regex } },
            ],
        );
    }

    let page = riders
        .paginate(filter, bson::doc! { "createdAtISO": -1 }, &query.pagination())
        .await?;

    Ok(Json(page.map(Into::into)))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResponse {
    pub rider_modified: bool,
    pub account_matched: bool,
    pub account_modified: bool,
}

/// Approve a pending application and promote the linked account to the
/// `rider` role. The two writes are separate: a missing account is
/// reported in the result instead of rolling the rider update back.
pub async fn approve(
    State(riders): State<RiderCollection>,
    State(users): State<UserCollection>,
    CurrentUser(acting): CurrentUser,
    PathObjectId(rider_id): PathObjectId,
) -> Result<Json<ApproveResponse>, Error> {
    ensure_admin(acting.role)
        .tap_err(|_| tracing::debug!("tried approving rider without admin role"))?;

    let rider = riders
        .find_one_by_id(rider_id)
        .await?
        .ok_or(Error::NotFound("rider"))?;

    match rider.status {
        RiderStatus::Pending => {}
        RiderStatus::Approved | RiderStatus::Rejected | RiderStatus::Deactivated => {
            return Err(Error::AlreadyProcessed("rider application"))
        }
    }

    let result = riders
        .update_one_where(
            bson::doc! {
                "_id": rider_id,
                "status": RiderStatus::Pending.as_str(),
            },
            bson::doc! {
                "$set": {
                    "status": RiderStatus::Approved.as_str(),
                    "approvedAt": bson::DateTime::from(OffsetDateTime::now_utc()),
                }
            },
        )
        .await?;

    if result.modified_count == 0 {
        return Err(Error::AlreadyProcessed("rider application"));
    }

    let account = users
        .update_one(
            bson::doc! { "email": &rider.created_by.email },
            bson::doc! {
                "$set": {
                    "role": UserRole::Rider.as_str(),
                    "updatedAt": bson::DateTime::from(OffsetDateTime::now_utc()),
                }
            },
            None,
        )
        .await
        .tap_err(|err| {
            tracing::error!(
                "rider {} approved but account promotion failed: {}",
                rider_id,
                err
            )
        })?;

    if account.matched_count == 0 {
        tracing::warn!(
            "rider {} approved but no account matches {}",
            rider_id,
            rider.created_by.email
        );
    }

    Ok(Json(ApproveResponse {
        rider_modified: true,
        account_matched: account.matched_count == 1,
        account_modified: account.modified_count == 1,
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusChangeResponse {
    pub modified: bool,
}

pub async fn reject(
    State(riders): State<RiderCollection>,
    CurrentUser(acting): CurrentUser,
    PathObjectId(rider_id): PathObjectId,
) -> Result<Json<StatusChangeResponse>, Error> {
    ensure_admin(acting.role)
        .tap_err(|_| tracing::debug!("tried rejecting rider without admin role"))?;

    let rider = riders
        .find_one_by_id(rider_id)
        .await?
        .ok_or(Error::NotFound("rider"))?;

    match rider.status {
        RiderStatus::Pending => {}
        RiderStatus::Approved | RiderStatus::Rejected | RiderStatus::Deactivated => {
            return Err(Error::AlreadyProcessed("rider application"))
        }
    }

    let result = riders
        .update_one_where(
            bson::doc! {
                "_id": rider_id,
                "status": RiderStatus::Pending.as_str(),
            },
            bson::doc! {
                "$set": {
                    "status": RiderStatus::Rejected.as_str(),
                    "rejectedAt": bson::DateTime::from(OffsetDateTime::now_utc()),
                }
            },
        )
        .await?;

    if result.modified_count == 0 {
        return Err(Error::AlreadyProcessed("rider application"));
    }

    Ok(Json(StatusChangeResponse { modified: true }))
}

/// Deactivation is one-way from `approved`. The linked account keeps the
/// `rider` role, mirroring the source system's asymmetry with approval.
pub async fn deactivate(
    State(riders): State<RiderCollection>,
    CurrentUser(acting): CurrentUser,
    PathObjectId(rider_id): PathObjectId,
) -> Result<Json<StatusChangeResponse>, Error> {
    ensure_admin(acting.role)
        .tap_err(|_| tracing::debug!("tried deactivating rider without admin role"))?;

    let rider = riders
        .find_one_by_id(rider_id)
        .await?
        .ok_or(Error::NotFound("rider"))?;

    match rider.status {
        RiderStatus::Approved => {}
        RiderStatus::Pending | RiderStatus::Rejected | RiderStatus::Deactivated => {
            return Err(Error::InvalidState("only approved riders can be deactivated"))
        }
    }

    let result = riders
        .update_one_where(
            bson::doc! {
                "_id": rider_id,
                "status": RiderStatus::Approved.as_str(),
            },
            bson::doc! {
                "$set": {
                    "status": RiderStatus::Deactivated.as_str(),
                    "deactivatedAt": bson::DateTime::from(OffsetDateTime::now_utc()),
                }
            },
        )
        .await?;

    if result.modified_count == 0 {
        return Err(Error::AlreadyProcessed("rider application"));
    }

    Ok(Json(StatusChangeResponse { modified: true }))
}

pub async fn me(
    State(riders): State<RiderCollection>,
    identity: Identity,
) -> Result<Json<RiderResponse>, Error> {
    let rider = riders
        .find_one(
            bson::doc! {
                "createdBy.email": &identity.email,
            },
            None,
        )
        .await?
        .ok_or(Error::NotFound("rider application"))?;

    Ok(Json(rider.into()))
}
