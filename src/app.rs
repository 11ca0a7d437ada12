use axum::extract::FromRef;

use crate::{
    api::v1::{
        auth::JwtState, parcel::ParcelCollection, payment::PaymentCollection,
        payment::StripeClient, rider::RiderCollection, user::UserCollection,
    },
    migrate::MigrationCollection,
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub jwt_state: JwtState,
    pub stripe: StripeClient,

    pub mongo_client: mongodb::Client,
    pub migrate_collection: MigrationCollection,
    pub user_collection: UserCollection,
    pub rider_collection: RiderCollection,
    pub parcel_collection: ParcelCollection,
    pub payment_collection: PaymentCollection,
}

impl AppState {
    pub async fn new(
        mongo_url: &str,
        database_name: &str,
        stripe: StripeClient,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let jwt_state = JwtState::new_from_env();

        let mongo_client_opt = mongodb::options::ClientOptions::parse(mongo_url).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(database_name);
        Ok(Self {
            jwt_state,
            stripe,

            mongo_client,
            migrate_collection: MigrationCollection(db.collection("migrations").into()),
            user_collection: UserCollection(db.collection("users").into()),
            rider_collection: RiderCollection(db.collection("riders").into()),
            parcel_collection: ParcelCollection(db.collection("parcels").into()),
            payment_collection: PaymentCollection(db.collection("payments").into()),
        })
    }

    pub async fn new_from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let mongodb_url = &std::env::var("MONGODB_URI")
            .expect("Cannot retreive MONGODB_URI from environment variable.");

        Self::new(mongodb_url, "parcelDB", StripeClient::new_from_env()).await
    }
}
