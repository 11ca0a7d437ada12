pub mod auth;
pub mod parcel;
pub mod payment;
pub mod rider;
pub mod user;

#[cfg(test)]
mod tests {
    use axum::{extract::State, Json};
    use base64::{engine::general_purpose, Engine as _};
    use bson::oid::ObjectId;
    use rust_decimal::Decimal;
    use time::OffsetDateTime;

    use crate::{app::AppState, error::Error};

    use super::{
        auth::{CurrentUser, Identity},
        parcel::{self, CreateParcelRequest, ParcelCollection, ParcelStatus},
        payment::{self, PaymentModel, StripeClient},
        rider::{self, ApplyRequest, RiderCollection},
        user::{AccountStatus, UserCollection, UserModel, UserRole},
    };

    pub struct Bootstrap {
        pub app_state: AppState,
        database_name: String,
    }

    impl Bootstrap {
        pub fn parcels(&self) -> State<ParcelCollection> {
            State(self.app_state.parcel_collection.clone())
        }

        pub fn riders(&self) -> State<RiderCollection> {
            State(self.app_state.rider_collection.clone())
        }

        pub fn users(&self) -> State<UserCollection> {
            State(self.app_state.user_collection.clone())
        }

        pub async fn create_user(&self, email: &str, role: UserRole) -> UserModel {
            let now = OffsetDateTime::now_utc();
            let model = UserModel {
                id: ObjectId::new(),
                uid: format!("uid-{}", ObjectId::new()),
                email: email.to_string(),
                name: email.to_string(),
                photo_url: None,
                provider: None,
                role,
                status: AccountStatus::Active,
                created_at: now.into(),
                updated_at: now.into(),
                last_login_at: now.into(),
            };

            self.app_state
                .user_collection
                .insert_one(&model, None)
                .await
                .unwrap();

            model
        }

        pub fn identity(&self, user: &UserModel) -> Identity {
            Identity {
                uid: user.uid.clone(),
                email: user.email.clone(),
            }
        }

        pub async fn cleanup(self) {
            self.app_state
                .mongo_client
                .database(&self.database_name)
                .drop(None)
                .await
                .unwrap();
        }
    }

    pub async fn bootstrap() -> Bootstrap {
        dotenvy::dotenv().ok();

        if std::env::var("JWT_SECRET_KEY").is_err() {
            std::env::set_var(
                "JWT_SECRET_KEY",
                general_purpose::STANDARD.encode(b"test-secret"),
            );
        }

        let mongodb_url = &std::env::var("MONGODB_URI")
            .expect("Cannot retreive MONGODB_URI from environment variable.");

        let database_name = format!("parcelDB-test-{}", ObjectId::new());
        let app_state = AppState::new(
            mongodb_url,
            &database_name,
            StripeClient::new("sk_test_unused", "http://localhost:9"),
        )
        .await
        .unwrap();

        Bootstrap {
            app_state,
            database_name,
        }
    }

    fn create_request(title: &str) -> CreateParcelRequest {
        CreateParcelRequest {
            parcel_title: title.to_string(),
            parcel_type: "document".to_string(),
            payment_type: "COD".to_string(),
            delivery_cost: Decimal::new(12000, 2).into(),
            cod_amount: Decimal::new(2500, 2).into(),
            sender_region: "Dhaka".to_string(),
            sender_center: "Dhaka Hub".to_string(),
            receiver_region: "Chattogram".to_string(),
            receiver_center: "Agrabad Hub".to_string(),
            tracking_id: None,
            created_by: None,
        }
    }

    async fn approved_rider(
        bootstrap: &Bootstrap,
        admin: &UserModel,
        email: &str,
        phone: &str,
        nid: &str,
    ) -> ObjectId {
        let applicant = bootstrap.create_user(email, UserRole::User).await;

        let rider = rider::apply(
            bootstrap.riders(),
            bootstrap.identity(&applicant),
            Json(ApplyRequest {
                name: email.to_string(),
                phone: phone.to_string(),
                nid: nid.to_string(),
            }),
        )
        .await
        .unwrap();

        rider::approve(
            bootstrap.riders(),
            bootstrap.users(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(*rider.0.id),
        )
        .await
        .unwrap();

        *rider.0.id
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_full_delivery_lifecycle() {
        let bootstrap = bootstrap().await;
        let admin = bootstrap.create_user("admin@example.com", UserRole::Admin).await;
        let sender = bootstrap.create_user("sender@example.com", UserRole::User).await;

        let parcel = parcel::create(
            bootstrap.parcels(),
            bootstrap.identity(&sender),
            Json(create_request("Books")),
        )
        .await
        .unwrap();
        let parcel_id = *parcel.0.id;
        assert_eq!(parcel.0.status, ParcelStatus::Created);

        let rider_id = approved_rider(
            &bootstrap,
            &admin,
            "rahim@example.com",
            "01711223344",
            "19901234567",
        )
        .await;

        // Account promotion happens on approval.
        let account = bootstrap
            .app_state
            .user_collection
            .find_one(bson::doc! { "email": "rahim@example.com" }, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.role, UserRole::Rider);

        parcel::assign(
            bootstrap.parcels(),
            bootstrap.riders(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(parcel_id),
            Json(parcel::AssignRequest {
                rider_id: rider_id.into(),
            }),
        )
        .await
        .unwrap();

        let rider_identity = Identity {
            uid: "uid-rider".to_string(),
            email: "rahim@example.com".to_string(),
        };

        for status in [
            ParcelStatus::PickedUp,
            ParcelStatus::InTransit,
            ParcelStatus::Delivered,
        ] {
            parcel::update_status(
                bootstrap.parcels(),
                bootstrap.riders(),
                rider_identity.clone(),
                crate::util::PathObjectId(parcel_id),
                Json(parcel::UpdateStatusRequest { status }),
            )
            .await
            .unwrap();
        }

        let delivered = bootstrap
            .app_state
            .parcel_collection
            .find_one_by_id(parcel_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.status, ParcelStatus::Delivered);

        let history: Vec<_> = delivered
            .status_history
            .iter()
            .map(|it| it.status)
            .collect();
        assert_eq!(
            history,
            vec![
                ParcelStatus::Created,
                ParcelStatus::Assigned,
                ParcelStatus::PickedUp,
                ParcelStatus::InTransit,
                ParcelStatus::Delivered,
            ]
        );

        // Terminal state refuses another assignment.
        let err = parcel::assign(
            bootstrap.parcels(),
            bootstrap.riders(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(parcel_id),
            Json(parcel::AssignRequest {
                rider_id: rider_id.into(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, Error::InvalidState(_));

        bootstrap.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_unassign_blocked_after_pickup() {
        let bootstrap = bootstrap().await;
        let admin = bootstrap.create_user("admin@example.com", UserRole::Admin).await;
        let sender = bootstrap.create_user("sender@example.com", UserRole::User).await;

        let parcel = parcel::create(
            bootstrap.parcels(),
            bootstrap.identity(&sender),
            Json(create_request("Electronics")),
        )
        .await
        .unwrap();
        let parcel_id = *parcel.0.id;

        let rider_id = approved_rider(
            &bootstrap,
            &admin,
            "karim@example.com",
            "01811223344",
            "19911234567",
        )
        .await;

        let assign = |bootstrap: &Bootstrap, admin: &UserModel| {
            parcel::assign(
                bootstrap.parcels(),
                bootstrap.riders(),
                CurrentUser(admin.clone()),
                crate::util::PathObjectId(parcel_id),
                Json(parcel::AssignRequest {
                    rider_id: rider_id.into(),
                }),
            )
        };

        assign(&bootstrap, &admin).await.unwrap();

        let unassigned = parcel::unassign(
            bootstrap.parcels(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(parcel_id),
        )
        .await
        .unwrap();
        assert_eq!(unassigned.0.status, ParcelStatus::Created);
        assert!(unassigned.0.assigned_rider.is_none());
        assert!(unassigned
            .0
            .status_history
            .last()
            .unwrap()
            .removed_rider
            .is_some());

        assign(&bootstrap, &admin).await.unwrap();

        parcel::update_status(
            bootstrap.parcels(),
            bootstrap.riders(),
            Identity {
                uid: "uid-rider".to_string(),
                email: "karim@example.com".to_string(),
            },
            crate::util::PathObjectId(parcel_id),
            Json(parcel::UpdateStatusRequest {
                status: ParcelStatus::PickedUp,
            }),
        )
        .await
        .unwrap();

        let err = parcel::unassign(
            bootstrap.parcels(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(parcel_id),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, Error::InvalidState(_));

        bootstrap.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_unassign_loser_modifies_nothing() {
        let bootstrap = bootstrap().await;
        let admin = bootstrap.create_user("admin@example.com", UserRole::Admin).await;
        let sender = bootstrap.create_user("sender@example.com", UserRole::User).await;

        let parcel = parcel::create(
            bootstrap.parcels(),
            bootstrap.identity(&sender),
            Json(create_request("Documents")),
        )
        .await
        .unwrap();
        let parcel_id = *parcel.0.id;

        let rider_id = approved_rider(
            &bootstrap,
            &admin,
            "salam@example.com",
            "01611223344",
            "19921234567",
        )
        .await;

        parcel::assign(
            bootstrap.parcels(),
            bootstrap.riders(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(parcel_id),
            Json(parcel::AssignRequest {
                rider_id: rider_id.into(),
            }),
        )
        .await
        .unwrap();

        parcel::unassign(
            bootstrap.parcels(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(parcel_id),
        )
        .await
        .unwrap();

        // A request that read the parcel before the unassignment landed
        // still issues the same conditional write. The parcel sits at
        // status created, inside the filter's status set, so only the
        // rider guard separates the loser from the winner.
        let result = bootstrap
            .app_state
            .parcel_collection
            .update_one_where(
                bson::doc! {
                    "_id": parcel_id,
                    "assignedRiderId": { "$ne": null },
                    "status": { "$in": ["created", "assigned"] },
                },
                bson::doc! {
                    "$set": {
                        "status": "created",
                        "assignedRiderId": null,
                        "assignedRider": null,
                        "unassignedAtISO": crate::util::now_iso(),
                    },
                    "$push": {
                        "statusHistory": { "status": "created", "timeISO": crate::util::now_iso() },
                    },
                },
            )
            .await
            .unwrap();
        assert_eq!(result.modified_count, 0);

        let stored = bootstrap
            .app_state
            .parcel_collection
            .find_one_by_id(parcel_id)
            .await
            .unwrap()
            .unwrap();
        let removals = stored
            .status_history
            .iter()
            .filter(|it| it.removed_rider.is_some())
            .count();
        assert_eq!(removals, 1);

        bootstrap.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_duplicate_confirmation_leaves_one_ledger_entry() {
        let bootstrap = bootstrap().await;
        let sender = bootstrap.create_user("sender@example.com", UserRole::User).await;

        let parcel = parcel::create(
            bootstrap.parcels(),
            bootstrap.identity(&sender),
            Json(create_request("Books")),
        )
        .await
        .unwrap();
        let parcel_id = *parcel.0.id;

        bootstrap
            .app_state
            .payment_collection
            .create_index(
                mongodb::IndexModel::builder()
                    .keys(bson::doc! { "parcelId": 1 })
                    .options(
                        mongodb::options::IndexOptions::builder()
                            .unique(true)
                            .build(),
                    )
                    .build(),
                None,
            )
            .await
            .unwrap();

        let ledger_entry = |intent: &str| PaymentModel {
            id: ObjectId::new(),
            parcel_id,
            user_email: sender.email.clone(),
            user_name: sender.name.clone(),
            parcel_name: "Books".to_string(),
            amount: Decimal::new(2500, 2),
            amount_in_cents: 2500,
            currency: "usd".to_string(),
            provider: "stripe".to_string(),
            payment_intent_id: intent.to_string(),
            payment_method: "card".to_string(),
            status: "succeeded".to_string(),
            created_at: OffsetDateTime::now_utc().into(),
        };

        let update = payment::record_payment(
            &bootstrap.app_state.parcel_collection,
            &bootstrap.app_state.payment_collection,
            &bootstrap.app_state.mongo_client,
            &ledger_entry("pi_first"),
        )
        .await
        .unwrap();
        assert_eq!(update.modified_count, 1);

        let paid = bootstrap
            .app_state
            .parcel_collection
            .find_one_by_id(parcel_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paid.payment_type, parcel::PaymentType::Paid);
        assert_eq!(paid.transaction_id.as_deref(), Some("pi_first"));

        let err = payment::record_payment(
            &bootstrap.app_state.parcel_collection,
            &bootstrap.app_state.payment_collection,
            &bootstrap.app_state.mongo_client,
            &ledger_entry("pi_second"),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, Error::Conflict(_));

        let ledger = bootstrap
            .app_state
            .payment_collection
            .count_documents(bson::doc! { "parcelId": parcel_id }, None)
            .await
            .unwrap();
        assert_eq!(ledger, 1);

        // The failed confirmation also left the parcel untouched.
        let stored = bootstrap
            .app_state
            .parcel_collection
            .find_one_by_id(parcel_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.transaction_id.as_deref(), Some("pi_first"));

        bootstrap.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_duplicate_phone_or_nid_conflicts() {
        let bootstrap = bootstrap().await;
        let first = bootstrap.create_user("first@example.com", UserRole::User).await;
        let second = bootstrap.create_user("second@example.com", UserRole::User).await;

        rider::apply(
            bootstrap.riders(),
            bootstrap.identity(&first),
            Json(ApplyRequest {
                name: "First".to_string(),
                phone: "01711223344".to_string(),
                nid: "19901234567".to_string(),
            }),
        )
        .await
        .unwrap();

        let err = rider::apply(
            bootstrap.riders(),
            bootstrap.identity(&second),
            Json(ApplyRequest {
                name: "Second".to_string(),
                phone: "01711223344".to_string(),
                nid: "20001234567".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, Error::Conflict(_));

        bootstrap.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_approve_is_single_shot() {
        let bootstrap = bootstrap().await;
        let admin = bootstrap.create_user("admin@example.com", UserRole::Admin).await;
        let applicant = bootstrap.create_user("rider@example.com", UserRole::User).await;

        let rider = rider::apply(
            bootstrap.riders(),
            bootstrap.identity(&applicant),
            Json(ApplyRequest {
                name: "Rider".to_string(),
                phone: "01911223344".to_string(),
                nid: "19951234567".to_string(),
            }),
        )
        .await
        .unwrap();

        rider::approve(
            bootstrap.riders(),
            bootstrap.users(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(*rider.0.id),
        )
        .await
        .unwrap();

        let err = rider::approve(
            bootstrap.riders(),
            bootstrap.users(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(*rider.0.id),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, Error::AlreadyProcessed(_));

        bootstrap.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_admin_cannot_demote_self() {
        let bootstrap = bootstrap().await;
        let admin = bootstrap.create_user("admin@example.com", UserRole::Admin).await;

        let err = super::user::change_role(
            bootstrap.users(),
            CurrentUser(admin.clone()),
            crate::util::PathObjectId(admin.id),
            Json(super::user::ChangeRoleRequest {
                role: "user".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, Error::InvalidOperation(_));

        bootstrap.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_login_upsert_preserves_role() {
        let bootstrap = bootstrap().await;

        let identity = Identity {
            uid: "uid-login".to_string(),
            email: "login@example.com".to_string(),
        };

        let first = super::user::login(
            bootstrap.users(),
            identity.clone(),
            Json(super::user::LoginRequest {
                name: "Login".to_string(),
                photo_url: None,
                provider: Some("google".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(first.0.is_new_user);

        bootstrap
            .app_state
            .user_collection
            .update_one(
                bson::doc! { "email": "login@example.com" },
                bson::doc! { "$set": { "role": "admin" } },
                None,
            )
            .await
            .unwrap();

        let second = super::user::login(
            bootstrap.users(),
            identity,
            Json(super::user::LoginRequest {
                name: "Renamed".to_string(),
                photo_url: None,
                provider: Some("google".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(!second.0.is_new_user);
        assert_eq!(first.0.id, second.0.id);

        // A later login refreshes the profile but never the role.
        let account = bootstrap
            .app_state
            .user_collection
            .find_one(bson::doc! { "email": "login@example.com" }, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.role, UserRole::Admin);
        assert_eq!(account.name, "Renamed");

        bootstrap.cleanup().await;
    }
}
