use axum::{extract::State, Json};
use bson::oid::ObjectId;
use mongodb::options::FindOptions;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    error::Error,
    mongo_ext::{is_duplicate_key_error, Collection},
    util::{FormattedDateTime, ObjectIdString},
};

use super::{auth::Identity, parcel::ParcelCollection};

pub const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Thin client for the payment gateway's REST API. The reconciler only
/// ever creates intents and reads back their captured state; capture
/// itself happens on the client side against the gateway directly.
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    base_url: String,
}

impl StripeClient {
    pub fn new(secret_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key: secret_key.into(),
            base_url: base_url.into(),
        }
    }

    pub fn new_from_env() -> Self {
        let secret_key = std::env::var("PAYMENT_GATEWAY_KEY")
            .expect("Cannot retreive PAYMENT_GATEWAY_KEY from environment variable.");
        let base_url =
            std::env::var("PAYMENT_GATEWAY_URL").unwrap_or_else(|_| STRIPE_API_BASE.to_string());

        Self::new(secret_key, base_url)
    }

    pub async fn create_intent(
        &self,
        amount_in_cents: i64,
        currency: &str,
    ) -> Result<PaymentIntent, Error> {
        self.http
            .post(format!("{}/v1/payment_intents", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[
                ("amount", amount_in_cents.to_string()),
                ("currency", currency.to_string()),
                ("payment_method_types[]", "card".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(Into::into)
    }

    pub async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, Error> {
        self.http
            .get(format!("{}/v1/payment_intents/{}", self.base_url, intent_id))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(Into::into)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,

    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
}

pub fn ensure_payment_succeeded(intent: &PaymentIntent) -> Result<(), Error> {
    if intent.status != "succeeded" {
        return Err(Error::PaymentNotSucceeded {
            status: intent.status.clone(),
        });
    }

    Ok(())
}

/// Expected captured amount in minor units: `round(codAmount * 100)`.
pub fn expected_amount_cents(cod_amount: Decimal) -> Result<i64, Error> {
    (cod_amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| Error::InvalidArgument("codAmount is out of range".to_string()))
}

pub fn ensure_amount_matches(cod_amount: Decimal, captured: i64) -> Result<i64, Error> {
    let expected = expected_amount_cents(cod_amount)?;

    if captured != expected {
        return Err(Error::AmountMismatch {
            expected,
            got: captured,
        });
    }

    Ok(expected)
}

#[derive(Clone)]
pub struct PaymentCollection(pub Collection<PaymentModel>);

impl std::ops::Deref for PaymentCollection {
    type Target = Collection<PaymentModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub parcel_id: ObjectId,

    pub user_email: String,
    pub user_name: String,
    pub parcel_name: String,

    pub amount: Decimal,
    pub amount_in_cents: i64,
    pub currency: String,

    pub provider: String,
    pub payment_intent_id: String,
    pub payment_method: String,
    pub status: String,

    pub created_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub id: ObjectIdString,
    pub parcel_id: ObjectIdString,

    pub user_email: String,
    pub user_name: String,
    pub parcel_name: String,

    pub amount: Decimal,
    pub amount_in_cents: i64,
    pub currency: String,

    pub provider: String,
    pub payment_intent_id: String,
    pub payment_method: String,
    pub status: String,

    pub created_at: FormattedDateTime,
}

impl From<PaymentModel> for PaymentResponse {
    fn from(value: PaymentModel) -> Self {
        Self {
            id: value.id.into(),
            parcel_id: value.parcel_id.into(),
            user_email: value.user_email,
            user_name: value.user_name,
            parcel_name: value.parcel_name,
            amount: value.amount,
            amount_in_cents: value.amount_in_cents,
            currency: value.currency,
            provider: value.provider,
            payment_intent_id: value.payment_intent_id,
            payment_method: value.payment_method,
            status: value.status,
            created_at: value.created_at.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    pub amount_in_cents: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentResponse {
    pub client_secret: String,
}

pub async fn create_intent(
    State(stripe): State<StripeClient>,
    _identity: Identity,
    Json(request): Json<CreateIntentRequest>,
) -> Result<Json<CreateIntentResponse>, Error> {
    if request.amount_in_cents <= 0 {
        return Err(Error::InvalidArgument(
            "amountInCents must be positive".to_string(),
        ));
    }

    let intent = stripe.create_intent(request.amount_in_cents, "usd").await?;

    let client_secret = intent
        .client_secret
        .ok_or(Error::InvalidState("gateway returned no client secret"))?;

    Ok(Json(CreateIntentResponse { client_secret }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub parcel_id: ObjectIdString,
    pub payment_intent_id: String,

    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub message: String,
    pub parcel_updated: bool,
    pub payment: PaymentResponse,
}

/// Reconcile an externally-captured payment against the parcel's expected
/// cost, then mark the parcel paid and append exactly one ledger entry.
/// The unique index on `payments.parcelId` makes a duplicate confirmation
/// fail as `Conflict` with the ledger unchanged.
pub async fn confirm(
    State(parcels): State<ParcelCollection>,
    State(payments): State<PaymentCollection>,
    State(stripe): State<StripeClient>,
    State(mongo): State<mongodb::Client>,
    identity: Identity,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, Error> {
    let parcel_id = *request.parcel_id;

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NotFound("parcel"))?;

    let intent = stripe.retrieve_intent(&request.payment_intent_id).await?;

    ensure_payment_succeeded(&intent)?;
    ensure_amount_matches(parcel.cod_amount, intent.amount)?;

    let payment = PaymentModel {
        id: ObjectId::new(),
        parcel_id,
        user_email: identity.email,
        user_name: request.user_name.unwrap_or_default(),
        parcel_name: parcel.parcel_title,
        amount: Decimal::new(intent.amount, 2),
        amount_in_cents: intent.amount,
        currency: intent.currency.clone(),
        provider: "stripe".to_string(),
        payment_intent_id: intent.id.clone(),
        payment_method: intent
            .payment_method_types
            .first()
            .cloned()
            .unwrap_or_else(|| "card".to_string()),
        status: intent.status.clone(),
        created_at: OffsetDateTime::now_utc().into(),
    };

    let update = record_payment(&parcels, &payments, &mongo, &payment).await?;

    Ok(Json(ConfirmResponse {
        message: "Payment recorded & parcel marked paid".to_string(),
        parcel_updated: update.modified_count == 1,
        payment: payment.into(),
    }))
}

/// Transactional half of confirmation: insert the ledger entry and mark
/// the parcel paid together. The unique index on `payments.parcelId`
/// turns a second confirmation into `Conflict` with neither write applied.
pub async fn record_payment(
    parcels: &ParcelCollection,
    payments: &PaymentCollection,
    mongo: &mongodb::Client,
    payment: &PaymentModel,
) -> Result<mongodb::results::UpdateResult, Error> {
    let mut session = mongo.start_session(None).await?;

    let transaction_options = mongodb::options::TransactionOptions::builder()
        .read_concern(mongodb::options::ReadConcern::snapshot())
        .write_concern(
            mongodb::options::WriteConcern::builder()
                .w(mongodb::options::Acknowledgment::Majority)
                .build(),
        )
        .build();

    session.start_transaction(transaction_options).await?;

    if let Err(err) = payments
        .insert_one_with_session(payment, None, &mut session)
        .await
    {
        let _ = session.abort_transaction().await;

        if is_duplicate_key_error(&err) {
            return Err(Error::Conflict(
                "payment already recorded for this parcel".to_string(),
            ));
        }
        return Err(err.into());
    }

    let update = parcels
        .update_one_with_session(
            bson::doc! { "_id": payment.parcel_id },
            bson::doc! {
                "$set": {
                    "paymentType": "paid",
                    "paidAt": bson::DateTime::from(OffsetDateTime::now_utc()),
                    "transactionId": &payment.payment_intent_id,
                }
            },
            None,
            &mut session,
        )
        .await;

    let update = match update {
        Ok(update) => update,
        Err(err) => {
            let _ = session.abort_transaction().await;
            return Err(err.into());
        }
    };

    session.commit_transaction().await?;

    Ok(update)
}

#[derive(Serialize, Debug)]
pub struct PaymentIndexResponse {
    pub payments: Vec<PaymentResponse>,
}

pub async fn index(
    State(payments): State<PaymentCollection>,
    identity: Identity,
) -> Result<Json<PaymentIndexResponse>, Error> {
    let found = payments
        .find_all(
            bson::doc! { "userEmail": &identity.email },
            FindOptions::builder()
                .sort(bson::doc! { "createdAt": -1 })
                .build(),
        )
        .await?;

    Ok(Json(PaymentIndexResponse {
        payments: found.into_iter().map(Into::into).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use std::str::FromStr;

    use super::*;

    fn intent(status: &str, amount: i64) -> PaymentIntent {
        PaymentIntent {
            id: "pi_test".to_string(),
            status: status.to_string(),
            amount,
            currency: "usd".to_string(),
            client_secret: None,
            payment_method_types: vec!["card".to_string()],
        }
    }

    #[test]
    fn test_expected_amount_is_cod_amount_in_cents() {
        assert_eq!(
            expected_amount_cents(Decimal::from_str("25.00").unwrap()).unwrap(),
            2500
        );
        assert_eq!(
            expected_amount_cents(Decimal::from_str("119.99").unwrap()).unwrap(),
            11999
        );
        assert_eq!(expected_amount_cents(Decimal::from(0)).unwrap(), 0);
    }

    #[test]
    fn test_amount_mismatch_reports_expected_and_got() {
        let err =
            ensure_amount_matches(Decimal::from_str("25.00").unwrap(), 2400).unwrap_err();
        assert_matches!(
            err,
            Error::AmountMismatch {
                expected: 2500,
                got: 2400
            }
        );

        assert_eq!(
            ensure_amount_matches(Decimal::from_str("25.00").unwrap(), 2500).unwrap(),
            2500
        );
    }

    #[test]
    fn test_non_succeeded_intent_is_rejected_with_observed_status() {
        let err = ensure_payment_succeeded(&intent("requires_payment_method", 2500)).unwrap_err();
        assert_matches!(err, Error::PaymentNotSucceeded { status } if status == "requires_payment_method");

        ensure_payment_succeeded(&intent("succeeded", 2500)).unwrap();
    }

    #[test]
    fn test_intent_deserializes_from_gateway_shape() {
        let intent: PaymentIntent = serde_json::from_str(
            r#"{
                "id": "pi_3LKQhvEpG",
                "object": "payment_intent",
                "amount": 2500,
                "currency": "usd",
                "status": "succeeded",
                "payment_method_types": ["card"],
                "client_secret": "pi_3LKQhvEpG_secret_xyz"
            }"#,
        )
        .unwrap();

        assert_eq!(intent.amount, 2500);
        assert_eq!(intent.status, "succeeded");
        assert_eq!(intent.client_secret.as_deref(), Some("pi_3LKQhvEpG_secret_xyz"));
    }

    #[test]
    fn test_ledger_amount_is_major_units() {
        assert_eq!(Decimal::new(2500, 2), Decimal::from_str("25.00").unwrap());
    }
}
