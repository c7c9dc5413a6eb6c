use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::model::User;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Display name used for presence and chat.
    pub name: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

impl Claims {
    pub fn user(&self) -> User {
        User {
            id: self.sub.clone(),
            username: self.name.clone(),
        }
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Claims>;
}

pub struct Hs256Verifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
}

impl Hs256Verifier {
    pub fn new(secret: String) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Signs a token for `user` valid for `ttl_secs`.
    pub fn issue(&self, user: &User, ttl_secs: u64) -> jsonwebtoken::errors::Result<String> {
        let exp = jsonwebtoken::get_current_timestamp() + ttl_secs;
        let claims = Claims {
            sub: user.id.clone(),
            name: user.username.clone(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[async_trait]
impl TokenVerifier for Hs256Verifier {
    async fn verify(&self, token: &str) -> Option<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding, &validation)
            .ok()
            .map(|d| d.claims)
    }
}
