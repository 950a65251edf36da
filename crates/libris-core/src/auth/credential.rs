use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The bearer credential for the current session.
///
/// `access` is treated as opaque. When it happens to be a JWT, its `exp` claim
/// is used to fill in `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Credential {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> Self {
        let access = access.into();
        let expires_at = TokenClaims::decode(&access).and_then(|claims| claims.expires_at());
        Self {
            access,
            refresh,
            issued_at: Utc::now(),
            expires_at,
        }
    }

    /// Build the successor of this credential after a refresh. The refresh
    /// token is kept unless the server rotated it.
    pub fn rotate(&self, access: impl Into<String>, refresh: Option<String>) -> Self {
        Self::new(access, refresh.or_else(|| self.refresh.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.access.trim().is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|expiry| Utc::now() >= expiry).unwrap_or(false)
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.map(|expiry| expiry - Utc::now())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.time_until_expiry().map(|d| d.num_minutes().max(0))
    }

    /// `user_id` claim of a JWT access token
    pub fn user_id(&self) -> Option<u64> {
        TokenClaims::decode(&self.access)?.user_id()
    }
}

/// The few JWT claims we look at. Signature is not verified; the server does
/// that.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    user_id: Option<serde_json::Value>,
}

impl TokenClaims {
    pub fn decode(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp?, 0).single()
    }

    pub fn user_id(&self) -> Option<u64> {
        match self.user_id.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn test_opaque_token_has_no_expiry() {
        let credential = Credential::new("T1", None);
        assert_eq!(credential.expires_at, None);
        assert!(!credential.is_expired());
        assert_eq!(credential.user_id(), None);
    }

    #[test]
    fn test_jwt_claims_fill_expiry_and_user() {
        let exp = (Utc::now() + Duration::minutes(30)).timestamp();
        let credential = Credential::new(jwt(serde_json::json!({"exp": exp, "user_id": 7})), None);

        assert_eq!(credential.expires_at.map(|e| e.timestamp()), Some(exp));
        assert_eq!(credential.user_id(), Some(7));
        assert!(!credential.is_expired());
        assert!(credential.minutes_until_expiry().unwrap() >= 29);
    }

    #[test]
    fn test_jwt_string_user_id_and_past_expiry() {
        let exp = (Utc::now() + Duration::minutes(2)).timestamp();
        let credential = Credential::new(jwt(serde_json::json!({"exp": exp, "user_id": "12"})), None);
        assert!(!credential.is_expired());
        assert_eq!(credential.user_id(), Some(12));

        let past = (Utc::now() - Duration::minutes(1)).timestamp();
        let expired = Credential::new(jwt(serde_json::json!({"exp": past})), None);
        assert!(expired.is_expired());
        assert_eq!(expired.minutes_until_expiry(), Some(0));
    }

    #[test]
    fn test_rotate_keeps_refresh_unless_replaced() {
        let original = Credential::new("T1", Some("R1".to_string()));
        assert_eq!(original.rotate("T2", None).refresh.as_deref(), Some("R1"));
        assert_eq!(
            original.rotate("T2", Some("R2".to_string())).refresh.as_deref(),
            Some("R2")
        );
    }

    #[test]
    fn test_garbage_tokens_decode_to_none() {
        assert!(TokenClaims::decode("a.b").is_none());
        assert!(TokenClaims::decode("a.!!!.c").is_none());
        assert!(TokenClaims::decode("a.b.c.d").is_none());
    }
}
