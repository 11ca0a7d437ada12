use axum::{
    extract::{FromRef, FromRequestParts},
    headers::{authorization::Bearer, Authorization},
    http::request::Parts,
    RequestPartsExt, TypedHeader,
};
use base64::{engine::general_purpose, Engine as _};
use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::{Duration, OffsetDateTime};

use crate::error::{Error, UnauthorizedType};

use super::user::{UserCollection, UserModel};

/// Verification state for the bearer assertions issued by the external
/// identity provider. The server never issues tokens on a request path; the
/// encoding half exists for tests and local tooling.
#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn from_secret(secret: &[u8]) -> Self {
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = false;

        Self {
            header,
            validation,

            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret),
            decoding_key: jsonwebtoken::DecodingKey::from_secret(secret),
        }
    }

    pub fn new_from_env() -> Self {
        let secret_key = std::env::var("JWT_SECRET_KEY")
            .expect("Cannot retreive JWT_SECRET_KEY from environment variable.");
        let secret_key = general_purpose::STANDARD
            .decode(secret_key)
            .expect("JWT_SECRET_KEY must be base64 encoded");

        Self::from_secret(&secret_key)
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IdentityClaims {
    pub sub: String,
    pub email: String,
    pub exp: i64,
}

impl IdentityClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub fn encode_identity_token(
    jwt_state: &JwtState,
    uid: &str,
    email: &str,
) -> Result<String, Error> {
    encode_identity_token_with_exp(
        jwt_state,
        uid,
        email,
        (current_timestamp() + Duration::hours(1)).unix_timestamp(),
    )
}

pub fn encode_identity_token_with_exp(
    jwt_state: &JwtState,
    uid: &str,
    email: &str,
    exp: i64,
) -> Result<String, Error> {
    jsonwebtoken::encode(
        &jwt_state.header,
        &IdentityClaims {
            sub: uid.to_string(),
            email: email.to_string(),
            exp,
        },
        &jwt_state.encoding_key,
    )
    .map_err(Into::into)
}

pub fn decode_identity_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<IdentityClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}

/// The verified identity of the caller: external subject plus email. This
/// is authentication only, role lookups happen through [`CurrentUser`].
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: String,
    pub email: String,
}

impl Identity {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_identity_token(jwt_state, token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        if token.claims.is_expired() {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
        }

        Ok(Self {
            uid: token.claims.sub,
            email: token.claims.email,
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Identity
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::MissingToken))
            .tap_err(|_| tracing::debug!("missing or malformed authorization header"))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

/// The caller's account record, resolved by the verified email. A valid
/// identity without an account is `Forbidden`, not `Unauthorized`: the
/// caller proved who they are but holds no role here.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserModel);

impl CurrentUser {
    pub async fn from_identity(
        identity: &Identity,
        UserCollection(users): &UserCollection,
    ) -> Result<Self, Error> {
        users
            .find_one(
                bson::doc! {
                    "email": &identity.email,
                },
                None,
            )
            .await?
            .map(Self)
            .ok_or(Error::Forbidden)
            .tap_err(|_| tracing::debug!("no account for verified identity"))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let identity = parts.extract_with_state::<Identity, _>(state).await?;
        let users = UserCollection::from_ref(state);
        Self::from_identity(&identity, &users).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::extract::FromRequestParts;

    use crate::error::{Error, UnauthorizedType};

    use super::*;

    fn jwt() -> JwtState {
        JwtState::from_secret(b"test-secret")
    }

    #[test]
    fn test_identity_token_roundtrip() {
        let jwt = jwt();

        let token = encode_identity_token(&jwt, "uid-1", "rider@example.com").unwrap();
        let identity = Identity::from_token(&jwt, &token).unwrap();

        assert_eq!(identity.uid, "uid-1");
        assert_eq!(identity.email, "rider@example.com");
    }

    #[test]
    fn test_expired_token_is_unauthorized() {
        let jwt = jwt();

        let token = encode_identity_token_with_exp(
            &jwt,
            "uid-1",
            "rider@example.com",
            (current_timestamp() - Duration::seconds(1)).unix_timestamp(),
        )
        .unwrap();

        let err = Identity::from_token(&jwt, &token).unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        );
    }

    #[test]
    fn test_garbage_token_is_unauthorized() {
        let err = Identity::from_token(&jwt(), "not-a-token").unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        );
    }

    #[test]
    fn test_wrong_key_is_unauthorized() {
        let token =
            encode_identity_token(&JwtState::from_secret(b"other"), "uid-1", "a@b.c").unwrap();

        let err = Identity::from_token(&jwt(), &token).unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        );
    }

    #[tokio::test]
    async fn test_missing_header_is_unauthorized() {
        #[derive(Clone)]
        struct State(JwtState);

        impl axum::extract::FromRef<State> for JwtState {
            fn from_ref(state: &State) -> Self {
                state.0.clone()
            }
        }

        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .body(())
            .unwrap()
            .into_parts();

        let err = Identity::from_request_parts(&mut parts, &State(jwt()))
            .await
            .unwrap_err();

        assert_matches!(err, Error::Unauthorized(UnauthorizedType::MissingToken));
    }

    #[tokio::test]
    async fn test_bearer_header_extraction() {
        #[derive(Clone)]
        struct State(JwtState);

        impl axum::extract::FromRef<State> for JwtState {
            fn from_ref(state: &State) -> Self {
                state.0.clone()
            }
        }

        let jwt_state = jwt();
        let token = encode_identity_token(&jwt_state, "uid-9", "admin@example.com").unwrap();

        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();

        let identity = Identity::from_request_parts(&mut parts, &State(jwt_state))
            .await
            .unwrap();

        assert_eq!(identity.email, "admin@example.com");
    }
}
