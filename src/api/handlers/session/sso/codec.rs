//! Signed SSO payloads.
//!
//! Wire format: a URL-encoded claim set, base64 encoded, signed with
//! HMAC-SHA256 over the base64 string and sent as `sso=<base64>&sig=<hex>`.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use url::{Url, form_urlencoded};

use super::super::directory::{User, UserDirectory};
use super::nonce::NonceStore;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SsoError {
    #[error("SSO secret is not configured")]
    MissingSecret,
    #[error("invalid SSO provider URL: {0}")]
    InvalidProviderUrl(String),
    #[error("missing query parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("signature mismatch")]
    BadSignature,
    #[error("payload is not valid base64 or UTF-8")]
    Undecodable,
    #[error("payload is missing `{0}`")]
    MissingClaim(&'static str),
}

/// Identity claims asserted by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SsoIdentity {
    pub external_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub admin: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SsoPayload {
    pub nonce: String,
    pub return_sso_url: Option<String>,
    pub identity: SsoIdentity,
}

impl SsoPayload {
    /// # Errors
    /// Propagates nonce store failures.
    pub async fn nonce_valid(&self, nonces: &dyn NonceStore) -> anyhow::Result<bool> {
        nonces.is_pending(&self.nonce).await
    }

    /// Consume the nonce, yielding the return path stored when it was issued.
    ///
    /// `None` means another request consumed it first.
    ///
    /// # Errors
    /// Propagates nonce store failures.
    pub async fn expire_nonce(&self, nonces: &dyn NonceStore) -> anyhow::Result<Option<String>> {
        nonces.consume(&self.nonce).await
    }

    /// # Errors
    /// Propagates directory failures.
    pub async fn lookup_or_create_user(
        &self,
        directory: &dyn UserDirectory,
    ) -> anyhow::Result<Option<User>> {
        directory.lookup_or_create_from_sso(&self.identity).await
    }
}

/// Signs outbound requests and verifies inbound assertions with a shared secret.
#[derive(Clone)]
pub struct SsoCodec {
    mac: HmacSha256,
}

impl SsoCodec {
    /// # Errors
    /// Returns `SsoError::MissingSecret` for an empty secret.
    pub fn new(secret: &str) -> Result<Self, SsoError> {
        if secret.is_empty() {
            return Err(SsoError::MissingSecret);
        }
        let mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SsoError::MissingSecret)?;
        Ok(Self { mac })
    }

    /// Hex-encoded HMAC-SHA256 of `payload`.
    #[must_use]
    pub fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify(&self, payload: &str, signature: &str) -> Result<(), SsoError> {
        let signature = hex::decode(signature.trim()).map_err(|_| SsoError::BadSignature)?;
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SsoError::BadSignature)
    }

    /// Encode `pairs` as a signed `(sso, sig)` couple.
    #[must_use]
    pub fn encode(&self, pairs: &[(&str, &str)]) -> (String, String) {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in pairs {
            serializer.append_pair(key, value);
        }
        let payload = STANDARD.encode(serializer.finish());
        let signature = self.sign(&payload);
        (payload, signature)
    }

    /// Provider URL the browser is redirected to when starting a login.
    ///
    /// # Errors
    /// Returns `SsoError::InvalidProviderUrl` when `provider_url` does not parse.
    pub fn generate_url(
        &self,
        provider_url: &str,
        nonce: &str,
        return_sso_url: &str,
    ) -> Result<String, SsoError> {
        let mut url = Url::parse(provider_url)
            .map_err(|err| SsoError::InvalidProviderUrl(err.to_string()))?;
        let (payload, signature) =
            self.encode(&[("nonce", nonce), ("return_sso_url", return_sso_url)]);
        url.query_pairs_mut()
            .append_pair("sso", &payload)
            .append_pair("sig", &signature);
        Ok(url.into())
    }

    /// Parse and verify the raw callback query string.
    ///
    /// # Errors
    /// Returns an `SsoError` for missing parameters, bad signatures, undecodable
    /// payloads or payloads without a nonce or external id.
    pub fn parse(&self, query: &str) -> Result<SsoPayload, SsoError> {
        let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        // Unescaped `+` in base64 arrives as a space after form decoding.
        let payload = params
            .get("sso")
            .map(|sso| sso.replace(' ', "+"))
            .ok_or(SsoError::MissingParameter("sso"))?;
        let signature = params.get("sig").ok_or(SsoError::MissingParameter("sig"))?;

        self.verify(&payload, signature)?;

        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = STANDARD
            .decode(compact.as_bytes())
            .map_err(|_| SsoError::Undecodable)?;
        let decoded = String::from_utf8(decoded).map_err(|_| SsoError::Undecodable)?;

        let mut claims: HashMap<String, String> = form_urlencoded::parse(decoded.as_bytes())
            .into_owned()
            .filter(|(_, value)| !value.trim().is_empty())
            .collect();

        let nonce = claims
            .remove("nonce")
            .ok_or(SsoError::MissingClaim("nonce"))?;
        let external_id = claims
            .remove("external_id")
            .ok_or(SsoError::MissingClaim("external_id"))?;

        Ok(SsoPayload {
            nonce,
            return_sso_url: claims.remove("return_sso_url"),
            identity: SsoIdentity {
                external_id,
                email: claims.remove("email"),
                username: claims.remove("username"),
                name: claims.remove("name"),
                admin: claims
                    .get("admin")
                    .is_some_and(|value| value.eq_ignore_ascii_case("true")),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "d0ntt3ll4ny0ne";

    fn callback_query(codec: &SsoCodec, pairs: &[(&str, &str)]) -> String {
        let (payload, signature) = codec.encode(pairs);
        form_urlencoded::Serializer::new(String::new())
            .append_pair("sso", &payload)
            .append_pair("sig", &signature)
            .finish()
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert_eq!(SsoCodec::new("").err(), Some(SsoError::MissingSecret));
    }

    #[test]
    fn parse_extracts_claims() -> Result<(), SsoError> {
        let codec = SsoCodec::new(SECRET)?;
        let query = callback_query(
            &codec,
            &[
                ("nonce", "abc"),
                ("external_id", "42"),
                ("email", "sam@example.com"),
                ("username", "sam"),
                ("name", "Sam Sample"),
                ("admin", "true"),
            ],
        );

        let payload = codec.parse(&query)?;
        assert_eq!(payload.nonce, "abc");
        assert_eq!(payload.identity.external_id, "42");
        assert_eq!(payload.identity.email.as_deref(), Some("sam@example.com"));
        assert_eq!(payload.identity.name.as_deref(), Some("Sam Sample"));
        assert!(payload.identity.admin);
        Ok(())
    }

    #[test]
    fn parse_accepts_unescaped_plus_in_payload() -> Result<(), SsoError> {
        let codec = SsoCodec::new(SECRET)?;
        let unescaped = (0..256).find_map(|i| {
            let name = format!("user {i}");
            let (payload, signature) =
                codec.encode(&[("nonce", "n"), ("external_id", "1"), ("name", &name)]);
            payload
                .contains('+')
                .then(|| (name, format!("sso={payload}&sig={signature}")))
        });
        let Some((name, query)) = unescaped else {
            panic!("no payload containing `+` was produced");
        };

        let parsed = codec.parse(&query)?;
        assert_eq!(parsed.identity.name, Some(name));
        Ok(())
    }

    #[test]
    fn tampered_payload_fails_signature() -> Result<(), SsoError> {
        let codec = SsoCodec::new(SECRET)?;
        let (_, signature) = codec.encode(&[("nonce", "n"), ("external_id", "1")]);
        let (forged, _) = codec.encode(&[("nonce", "n"), ("external_id", "2")]);
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("sso", &forged)
            .append_pair("sig", &signature)
            .finish();
        assert_eq!(codec.parse(&query), Err(SsoError::BadSignature));

        let other = SsoCodec::new("another-secret")?;
        let query = callback_query(&other, &[("nonce", "n"), ("external_id", "1")]);
        assert_eq!(codec.parse(&query), Err(SsoError::BadSignature));
        Ok(())
    }

    #[test]
    fn missing_parameters_and_claims_are_reported() -> Result<(), SsoError> {
        let codec = SsoCodec::new(SECRET)?;
        assert_eq!(codec.parse("sig=00"), Err(SsoError::MissingParameter("sso")));
        assert_eq!(codec.parse("sso=AA"), Err(SsoError::MissingParameter("sig")));

        let query = callback_query(&codec, &[("external_id", "1")]);
        assert_eq!(codec.parse(&query), Err(SsoError::MissingClaim("nonce")));

        let query = callback_query(&codec, &[("nonce", "n")]);
        assert_eq!(codec.parse(&query), Err(SsoError::MissingClaim("external_id")));
        Ok(())
    }

    #[test]
    fn signed_garbage_is_undecodable() -> Result<(), SsoError> {
        let codec = SsoCodec::new(SECRET)?;
        let payload = "not*base64";
        let query = format!("sso={payload}&sig={}", codec.sign(payload));
        assert_eq!(codec.parse(&query), Err(SsoError::Undecodable));
        Ok(())
    }

    #[test]
    fn generate_url_round_trips_through_provider() -> Result<(), SsoError> {
        let codec = SsoCodec::new(SECRET)?;
        let url = codec.generate_url(
            "https://idp.example.com/sso?client=forum",
            "nonce-1",
            "https://forum.example.com/session/sso_login",
        )?;
        assert!(url.starts_with("https://idp.example.com/sso?client=forum&sso="));

        let parsed = Url::parse(&url).map_err(|err| SsoError::InvalidProviderUrl(err.to_string()))?;
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        let payload = params.get("sso").ok_or(SsoError::MissingParameter("sso"))?;
        let signature = params.get("sig").ok_or(SsoError::MissingParameter("sig"))?;
        assert_eq!(&codec.sign(payload), signature);

        let decoded = STANDARD.decode(payload).map_err(|_| SsoError::Undecodable)?;
        let decoded = String::from_utf8(decoded).map_err(|_| SsoError::Undecodable)?;
        assert!(decoded.contains("nonce=nonce-1"));
        assert!(decoded.contains("return_sso_url=https%3A%2F%2Fforum.example.com%2Fsession%2Fsso_login"));
        Ok(())
    }

    #[test]
    fn invalid_provider_url_is_reported() -> Result<(), SsoError> {
        let codec = SsoCodec::new(SECRET)?;
        assert!(matches!(
            codec.generate_url("not a url", "n", "/"),
            Err(SsoError::InvalidProviderUrl(_))
        ));
        Ok(())
    }
}
