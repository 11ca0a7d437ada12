use axum::{
    extract::{Path, Query, State},
    Json,
};
use bson::oid::ObjectId;
use mongodb::options::FindOptions;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::{is_duplicate_key_error, Collection, Paginated, Pagination},
    util::{now_iso, DecimalString, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{
    auth::{CurrentUser, Identity},
    rider::{CreatedBy, RiderCollection, RiderModel, RiderStatus},
    user::UserRole,
};

#[derive(Clone)]
pub struct ParcelCollection(pub Collection<ParcelModel>);

impl std::ops::Deref for ParcelCollection {
    type Target = Collection<ParcelModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ParcelModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub tracking_id: String,
    pub parcel_title: String,
    pub parcel_type: String,

    pub payment_type: PaymentType,
    pub delivery_cost: Decimal,
    pub cod_amount: Decimal,

    pub sender_region: String,
    pub sender_center: String,
    pub receiver_region: String,
    pub receiver_center: String,

    pub status: ParcelStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_rider_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_rider: Option<RiderSnapshot>,
    #[serde(
        rename = "assignedRiderAtISO",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub assigned_rider_at_iso: Option<String>,
    #[serde(
        rename = "unassignedAtISO",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unassigned_at_iso: Option<String>,

    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,

    pub created_by: CreatedBy,

    #[serde(rename = "createdAtISO")]
    pub created_at_iso: String,
    #[serde(rename = "updatedAtISO")]
    pub updated_at_iso: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    #[default]
    Cod,
    Paid,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Cod => "cod",
            PaymentType::Paid => "paid",
        }
    }

    /// Payment types arrive in arbitrary casing and are normalized to
    /// lowercase at parcel creation.
    pub fn normalize(raw: &str) -> Result<Self, Error> {
        match raw.to_lowercase().as_str() {
            "cod" => Ok(PaymentType::Cod),
            "paid" => Ok(PaymentType::Paid),
            other => Err(Error::InvalidArgument(format!(
                "{} is not a valid payment type",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParcelStatus {
    #[default]
    Created,
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
}

impl ParcelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParcelStatus::Created => "created",
            ParcelStatus::Assigned => "assigned",
            ParcelStatus::PickedUp => "picked_up",
            ParcelStatus::InTransit => "in_transit",
            ParcelStatus::Delivered => "delivered",
        }
    }

    /// The wire names are snake_case, matching the serde representation.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "created" => Ok(ParcelStatus::Created),
            "assigned" => Ok(ParcelStatus::Assigned),
            "picked_up" => Ok(ParcelStatus::PickedUp),
            "in_transit" => Ok(ParcelStatus::InTransit),
            "delivered" => Ok(ParcelStatus::Delivered),
            other => Err(Error::InvalidArgument(format!(
                "{} is not a valid parcel status",
                other
            ))),
        }
    }

    /// The single forward state a rider may move a parcel into.
    /// `created → assigned` is admin-only (rider assignment), and
    /// `delivered` is terminal.
    pub fn rider_successor(self) -> Option<ParcelStatus> {
        match self {
            ParcelStatus::Assigned => Some(ParcelStatus::PickedUp),
            ParcelStatus::PickedUp => Some(ParcelStatus::InTransit),
            ParcelStatus::InTransit => Some(ParcelStatus::Delivered),
            ParcelStatus::Created | ParcelStatus::Delivered => None,
        }
    }
}

/// Checks a rider-requested transition against the fixed successor table,
/// naming the expected next state on mismatch.
pub fn validate_rider_transition(
    current: ParcelStatus,
    requested: ParcelStatus,
) -> Result<ParcelStatus, Error> {
    let expected = match current.rider_successor() {
        Some(expected) => expected,
        None => {
            return Err(match current {
                ParcelStatus::Delivered => Error::InvalidState("parcel is already delivered"),
                _ => Error::InvalidState("parcel has no rider assigned yet"),
            })
        }
    };

    if requested != expected {
        return Err(Error::InvalidTransition {
            current: current.as_str(),
            expected: expected.as_str(),
            requested: requested.as_str().to_string(),
        });
    }

    Ok(expected)
}

/// Rider identity frozen at assignment time, so later changes to the rider
/// record never rewrite what a parcel's audit trail says happened.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RiderSnapshot {
    pub id: ObjectIdString,
    pub name: String,
    pub phone: String,
    pub email: String,
}

impl From<&RiderModel> for RiderSnapshot {
    fn from(rider: &RiderModel) -> Self {
        Self {
            id: rider.id.into(),
            name: rider.name.clone(),
            phone: rider.phone.clone(),
            email: rider.created_by.email.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub status: ParcelStatus,

    #[serde(rename = "timeISO")]
    pub time_iso: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_role: Option<UserRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rider: Option<RiderSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_rider: Option<RiderSnapshot>,
}

impl StatusHistoryEntry {
    pub fn new(status: ParcelStatus) -> Self {
        Self {
            status,
            time_iso: now_iso(),
            by: None,
            by_role: None,
            rider: None,
            removed_rider: None,
        }
    }

    pub fn by(mut self, email: &str, role: UserRole) -> Self {
        self.by = Some(email.to_string());
        self.by_role = Some(role);
        self
    }

    pub fn with_rider(mut self, snapshot: RiderSnapshot) -> Self {
        self.rider = Some(snapshot);
        self
    }

    pub fn with_removed_rider(mut self, snapshot: RiderSnapshot) -> Self {
        self.removed_rider = Some(snapshot);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ParcelResponse {
    pub id: ObjectIdString,

    pub tracking_id: String,
    pub parcel_title: String,
    pub parcel_type: String,

    pub payment_type: PaymentType,
    pub delivery_cost: Decimal,
    pub cod_amount: Decimal,

    pub sender_region: String,
    pub sender_center: String,
    pub receiver_region: String,
    pub receiver_center: String,

    pub status: ParcelStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_rider_id: Option<ObjectIdString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_rider: Option<RiderSnapshot>,
    #[serde(rename = "assignedRiderAtISO", skip_serializing_if = "Option::is_none")]
    pub assigned_rider_at_iso: Option<String>,
    #[serde(rename = "unassignedAtISO", skip_serializing_if = "Option::is_none")]
    pub unassigned_at_iso: Option<String>,

    pub status_history: Vec<StatusHistoryEntry>,

    pub created_by: CreatedBy,

    #[serde(rename = "createdAtISO")]
    pub created_at_iso: String,
    #[serde(rename = "updatedAtISO")]
    pub updated_at_iso: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<FormattedDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl From<ParcelModel> for ParcelResponse {
    fn from(value: ParcelModel) -> Self {
        Self {
            id: value.id.into(),
            tracking_id: value.tracking_id,
            parcel_title: value.parcel_title,
            parcel_type: value.parcel_type,
            payment_type: value.payment_type,
            delivery_cost: value.delivery_cost,
            cod_amount: value.cod_amount,
            sender_region: value.sender_region,
            sender_center: value.sender_center,
            receiver_region: value.receiver_region,
            receiver_center: value.receiver_center,
            status: value.status,
            assigned_rider_id: value.assigned_rider_id.map(Into::into),
            assigned_rider: value.assigned_rider,
            assigned_rider_at_iso: value.assigned_rider_at_iso,
            unassigned_at_iso: value.unassigned_at_iso,
            status_history: value.status_history,
            created_by: value.created_by,
            created_at_iso: value.created_at_iso,
            updated_at_iso: value.updated_at_iso,
            paid_at: value.paid_at.map(Into::into),
            transaction_id: value.transaction_id,
        }
    }
}

pub fn generate_tracking_id() -> String {
    format!("PCL-{}", ObjectId::new().to_hex().to_uppercase())
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateParcelRequest {
    #[validate(length(min = 1, max = 124))]
    pub parcel_title: String,

    #[validate(length(min = 1, max = 64))]
    pub parcel_type: String,

    pub payment_type: String,

    pub delivery_cost: DecimalString,
    pub cod_amount: DecimalString,

    #[validate(length(min = 1, max = 124))]
    pub sender_region: String,
    #[validate(length(min = 1, max = 124))]
    pub sender_center: String,
    #[validate(length(min = 1, max = 124))]
    pub receiver_region: String,
    #[validate(length(min = 1, max = 124))]
    pub receiver_center: String,

    #[serde(default)]
    pub tracking_id: Option<String>,

    #[serde(default)]
    pub created_by: Option<CreatedBy>,
}

pub async fn create(
    State(parcels): State<ParcelCollection>,
    identity: Identity,
    Json(request): Json<CreateParcelRequest>,
) -> Result<Json<ParcelResponse>, Error> {
    request.validate()?;

    let payment_type = PaymentType::normalize(&request.payment_type)?;

    let now = now_iso();
    let model = ParcelModel {
        id: ObjectId::new(),
        tracking_id: request.tracking_id.unwrap_or_else(generate_tracking_id),
        parcel_title: request.parcel_title,
        parcel_type: request.parcel_type,
        payment_type,
        delivery_cost: request.delivery_cost.into(),
        cod_amount: request.cod_amount.into(),
        sender_region: request.sender_region,
        sender_center: request.sender_center,
        receiver_region: request.receiver_region,
        receiver_center: request.receiver_center,
        status: ParcelStatus::Created,
        assigned_rider_id: None,
        assigned_rider: None,
        assigned_rider_at_iso: None,
        unassigned_at_iso: None,
        status_history: vec![StatusHistoryEntry::new(ParcelStatus::Created)],
        created_by: request.created_by.unwrap_or(CreatedBy {
            email: identity.email,
        }),
        created_at_iso: now.clone(),
        updated_at_iso: now,
        paid_at: None,
        transaction_id: None,
    };

    tracing::debug!("creating parcel {}", model.tracking_id);

    if let Err(err) = parcels.insert_one(&model, None).await {
        if is_duplicate_key_error(&err) {
            return Err(Error::Conflict(
                "a parcel with this tracking id already exists".to_string(),
            ));
        }
        return Err(err.into());
    }

    Ok(Json(model.into()))
}

#[derive(Serialize, Debug)]
pub struct IndexResponse {
    pub parcels: Vec<ParcelResponse>,
}

pub async fn index(
    State(parcels): State<ParcelCollection>,
    CurrentUser(acting): CurrentUser,
) -> Result<Json<IndexResponse>, Error> {
    match acting.role {
        UserRole::User | UserRole::Rider => {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("tried listing all parcels without admin role"))
        }
        UserRole::Admin => {}
    }

    let found = parcels
        .find_all(
            None,
            FindOptions::builder()
                .sort(bson::doc! { "createdAtISO": -1 })
                .build(),
        )
        .await?;

    Ok(Json(IndexResponse {
        parcels: found.into_iter().map(Into::into).collect(),
    }))
}

pub async fn user_index(
    State(parcels): State<ParcelCollection>,
    identity: Identity,
) -> Result<Json<IndexResponse>, Error> {
    let found = parcels
        .find_all(
            bson::doc! { "createdBy.email": &identity.email },
            FindOptions::builder()
                .sort(bson::doc! { "createdAtISO": -1 })
                .build(),
        )
        .await?;

    Ok(Json(IndexResponse {
        parcels: found.into_iter().map(Into::into).collect(),
    }))
}

pub async fn rider_index(
    State(parcels): State<ParcelCollection>,
    State(riders): State<RiderCollection>,
    identity: Identity,
) -> Result<Json<IndexResponse>, Error> {
    let rider = riders
        .find_one(
            bson::doc! {
                "createdBy.email": &identity.email,
                "status": RiderStatus::Approved.as_str(),
            },
            None,
        )
        .await?
        .ok_or(Error::Forbidden)
        .tap_err(|_| tracing::debug!("tried listing rider parcels without approved application"))?;

    let found = parcels
        .find_all(
            bson::doc! { "assignedRiderId": rider.id },
            FindOptions::builder()
                .sort(bson::doc! { "updatedAtISO": -1 })
                .build(),
        )
        .await?;

    Ok(Json(IndexResponse {
        parcels: found.into_iter().map(Into::into).collect(),
    }))
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AdminIndexQuery {
    pub page: Option<u64>,
    pub limit: Option<i64>,
    pub payment_type: Option<String>,
    pub status: Option<String>,
}

impl AdminIndexQuery {
    fn pagination(&self) -> Pagination {
        Pagination {
            page: self.page,
            limit: self.limit,
        }
    }
}

pub async fn admin_index(
    State(parcels): State<ParcelCollection>,
    CurrentUser(acting): CurrentUser,
    Query(query): Query<AdminIndexQuery>,
) -> Result<Json<Paginated<ParcelResponse>>, Error> {
    match acting.role {
        UserRole::User | UserRole::Rider => return Err(Error::Forbidden),
        UserRole::Admin => {}
    }

    let mut filter = bson::doc! {};

    if let Some(payment_type) = query.payment_type.as_deref() {
        filter.insert("paymentType", PaymentType::normalize(payment_type)?.as_str());
    }
    if let Some(status) = query.status.as_deref() {
        filter.insert("status", ParcelStatus::parse(status)?.as_str());
    }

    let page = parcels
        .paginate(
            filter,
            bson::doc! { "createdAtISO": -1 },
            &query.pagination(),
        )
        .await?;

    Ok(Json(page.map(Into::into)))
}

pub async fn show(
    State(parcels): State<ParcelCollection>,
    _identity: Identity,
    PathObjectId(parcel_id): PathObjectId,
) -> Result<Json<ParcelResponse>, Error> {
    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    Ok(Json(parcel.into()))
}

/// Public tracking projection: route and status only, none of the internal
/// ids or the creator's email.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrackResponse {
    pub tracking_id: String,
    pub parcel_title: String,
    pub parcel_type: String,

    pub payment_type: PaymentType,
    pub delivery_cost: Decimal,
    pub cod_amount: Decimal,

    pub sender_region: String,
    pub sender_center: String,
    pub receiver_region: String,
    pub receiver_center: String,

    pub status: ParcelStatus,
    pub status_history: Vec<StatusHistoryEntry>,

    #[serde(rename = "createdAtISO")]
    pub created_at_iso: String,
}

impl From<ParcelModel> for TrackResponse {
    fn from(value: ParcelModel) -> Self {
        Self {
            tracking_id: value.tracking_id,
            parcel_title: value.parcel_title,
            parcel_type: value.parcel_type,
            payment_type: value.payment_type,
            delivery_cost: value.delivery_cost,
            cod_amount: value.cod_amount,
            sender_region: value.sender_region,
            sender_center: value.sender_center,
            receiver_region: value.receiver_region,
            receiver_center: value.receiver_center,
            status: value.status,
            status_history: value.status_history,
            created_at_iso: value.created_at_iso,
        }
    }
}

pub async fn track(
    State(parcels): State<ParcelCollection>,
    Path(tracking_id): Path<String>,
) -> Result<Json<TrackResponse>, Error> {
    let parcel = parcels
        .find_one(
            bson::doc! { "trackingId": &tracking_id },
            None,
        )
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    Ok(Json(parcel.into()))
}

pub async fn delete(
    State(parcels): State<ParcelCollection>,
    CurrentUser(acting): CurrentUser,
    PathObjectId(parcel_id): PathObjectId,
) -> Result<(), Error> {
    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    match acting.role {
        UserRole::Admin => {}
        UserRole::User | UserRole::Rider => {
            if parcel.created_by.email != acting.email {
                return Err(Error::Forbidden)
                    .tap_err(|_| tracing::debug!("tried deleting another user's parcel"));
            }
        }
    }

    parcels
        .delete_one(bson::doc! { "_id": parcel_id }, None)
        .await?;

    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub rider_id: ObjectIdString,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssignResponse {
    pub assigned_rider: RiderSnapshot,
}

pub async fn assign(
    State(parcels): State<ParcelCollection>,
    State(riders): State<RiderCollection>,
    CurrentUser(acting): CurrentUser,
    PathObjectId(parcel_id): PathObjectId,
    Json(request): Json<AssignRequest>,
) -> Result<Json<AssignResponse>, Error> {
    match acting.role {
        UserRole::User | UserRole::Rider => {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("tried assigning rider without admin role"))
        }
        UserRole::Admin => {}
    }

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    if parcel.status == ParcelStatus::Delivered {
        return Err(Error::InvalidState("parcel is already delivered"));
    }

    let rider = riders
        .find_one_by_id(*request.rider_id)
        .await?
        .ok_or(Error::NotFound("rider"))?;

    if rider.status != RiderStatus::Approved {
        return Err(Error::InvalidState("rider is not approved"));
    }

    let snapshot = RiderSnapshot::from(&rider);

    let entry = StatusHistoryEntry::new(ParcelStatus::Assigned)
        .by(&acting.email, acting.role)
        .with_rider(snapshot.clone());

    let result = parcels
        .update_one_where(
            bson::doc! {
                "_id": parcel_id,
                "status": { "$ne": ParcelStatus::Delivered.as_str() },
            },
            bson::doc! {
                "$set": {
                    "status": ParcelStatus::Assigned.as_str(),
                    "assignedRiderId": rider.id,
                    "assignedRider": bson::to_bson(&snapshot)?,
                    "assignedRiderAtISO": now_iso(),
                    "updatedAtISO": now_iso(),
                },
                "$push": {
                    "statusHistory": bson::to_bson(&entry)?,
                },
            },
        )
        .await?;

    if result.modified_count == 0 {
        return Err(Error::AlreadyProcessed("parcel assignment"));
    }

    Ok(Json(AssignResponse {
        assigned_rider: snapshot,
    }))
}

pub async fn unassign(
    State(parcels): State<ParcelCollection>,
    CurrentUser(acting): CurrentUser,
    PathObjectId(parcel_id): PathObjectId,
) -> Result<Json<ParcelResponse>, Error> {
    match acting.role {
        UserRole::User | UserRole::Rider => {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("tried unassigning rider without admin role"))
        }
        UserRole::Admin => {}
    }

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    let removed = match parcel.assigned_rider {
        Some(ref snapshot) => snapshot.clone(),
        None => return Err(Error::InvalidState("parcel has no rider assigned")),
    };

    match parcel.status {
        ParcelStatus::Created | ParcelStatus::Assigned => {}
        ParcelStatus::PickedUp | ParcelStatus::InTransit | ParcelStatus::Delivered => {
            // Once the rider physically handled the parcel, unassignment
            // would orphan the delivery.
            return Err(Error::InvalidState(
                "parcel is already handled by the rider",
            ));
        }
    }

    let entry = StatusHistoryEntry::new(ParcelStatus::Created)
        .by(&acting.email, acting.role)
        .with_removed_rider(removed);

    let result = parcels
        .update_one_where(
            bson::doc! {
                "_id": parcel_id,
                // A concurrent unassign leaves status at created, so the
                // rider field is the part of the prior state that tells
                // the winner from the loser.
                "assignedRiderId": { "$ne": null },
                "status": {
                    "$in": [
                        ParcelStatus::Created.as_str(),
                        ParcelStatus::Assigned.as_str(),
                    ]
                },
            },
            bson::doc! {
                "$set": {
                    "status": ParcelStatus::Created.as_str(),
                    "assignedRiderId": null,
                    "assignedRider": null,
                    "assignedRiderAtISO": null,
                    "unassignedAtISO": now_iso(),
                    "updatedAtISO": now_iso(),
                },
                "$push": {
                    "statusHistory": bson::to_bson(&entry)?,
                },
            },
        )
        .await?;

    if result.modified_count == 0 {
        return Err(Error::AlreadyProcessed("parcel unassignment"));
    }

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    Ok(Json(parcel.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateStatusRequest {
    pub status: ParcelStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateStatusResponse {
    pub modified: bool,
}

/// Rider-driven forward transition. The caller must hold the approved
/// application the parcel is assigned to, and may only step to the single
/// next state in the fixed table.
pub async fn update_status(
    State(parcels): State<ParcelCollection>,
    State(riders): State<RiderCollection>,
    identity: Identity,
    PathObjectId(parcel_id): PathObjectId,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<UpdateStatusResponse>, Error> {
    let rider = riders
        .find_one(
            bson::doc! {
                "createdBy.email": &identity.email,
                "status": RiderStatus::Approved.as_str(),
            },
            None,
        )
        .await?
        .ok_or(Error::Forbidden)
        .tap_err(|_| tracing::debug!("status change without approved rider application"))?;

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    if parcel.assigned_rider_id != Some(rider.id) {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("rider tried advancing a parcel assigned to another"));
    }

    let next = validate_rider_transition(parcel.status, request.status)?;

    let entry = StatusHistoryEntry::new(next).by(&identity.email, UserRole::Rider);

    let result = parcels
        .update_one_where(
            bson::doc! {
                "_id": parcel_id,
                "status": parcel.status.as_str(),
            },
            bson::doc! {
                "$set": {
                    "status": next.as_str(),
                    "updatedAtISO": now_iso(),
                },
                "$push": {
                    "statusHistory": bson::to_bson(&entry)?,
                },
            },
        )
        .await?;

    if result.modified_count == 0 {
        return Err(Error::AlreadyProcessed("parcel status change"));
    }

    Ok(Json(UpdateStatusResponse { modified: true }))
}
