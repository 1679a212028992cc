use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported external messaging platforms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Facebook,
    Instagram,
    Whatsapp,
    Telegram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "facebook" => Ok(Self::Facebook),
            "instagram" => Ok(Self::Instagram),
            "whatsapp" => Ok(Self::Whatsapp),
            "telegram" => Ok(Self::Telegram),
            _ => Err(format!("Invalid platform: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Verified,
    Failed,
    NeedsCheck,
    NeedsReconnect,
    TokenExpired,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::NeedsCheck => "needs_check",
            Self::NeedsReconnect => "needs_reconnect",
            Self::TokenExpired => "token_expired",
        }
    }

    /// Statuses that mean stored credentials can no longer be trusted.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            Self::TokenExpired | Self::NeedsReconnect | Self::NeedsCheck
        )
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "failed" => Ok(Self::Failed),
            "needs_check" => Ok(Self::NeedsCheck),
            "needs_reconnect" => Ok(Self::NeedsReconnect),
            "token_expired" => Ok(Self::TokenExpired),
            _ => Err(format!("Invalid verification status: {}", s)),
        }
    }
}

/// Opaque platform credential. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialToken(String);

impl CredentialToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CredentialToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialToken(***)")
    }
}

/// A page or channel the authorizing identity can connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectableResource {
    #[serde(alias = "externalId", alias = "id")]
    pub external_id: String,
    #[serde(alias = "displayName", alias = "name")]
    pub display_name: String,
    #[serde(default, alias = "capabilityTags")]
    pub capability_tags: BTreeSet<String>,
    #[serde(default, alias = "accessToken", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<CredentialToken>,
}

impl ConnectableResource {
    pub fn new(external_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            display_name: display_name.into(),
            capability_tags: BTreeSet::new(),
            access_token: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.insert(tag.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(CredentialToken::new(token));
        self
    }
}

/// The external account that granted authorization (display only).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalIdentity {
    #[serde(alias = "displayName", alias = "name")]
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookAccount {
    pub id: i64,
    pub tenant_id: String,
    pub platform: Platform,
    pub external_resource_id: String,
    pub display_name: String,
    /// Accepted from the backend, never written back out.
    #[serde(default, skip_serializing)]
    pub credential_token: Option<CredentialToken>,
    pub is_active: bool,
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub ai_enabled: bool,
    #[serde(default)]
    pub auto_reply: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingMapping {
    pub id: i64,
    pub tenant_id: String,
    pub account_id: i64,
    pub platform: Platform,
    pub external_resource_id: String,
    pub created_at: DateTime<Utc>,
}

/// User-controlled behavior flags on an account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountFlags {
    pub ai_enabled: bool,
    pub auto_reply: bool,
}

// Write payloads

#[derive(Debug, Clone, Serialize)]
pub struct NewWebhookAccount {
    pub tenant_id: String,
    pub platform: Platform,
    pub external_resource_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_token: Option<CredentialToken>,
    pub is_active: bool,
    pub verification_status: VerificationStatus,
    pub ai_enabled: bool,
    pub auto_reply: bool,
}

/// Partial account update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_token: Option<CredentialToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<VerificationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reply: Option<bool>,
}

impl AccountUpdate {
    pub fn status(status: VerificationStatus) -> Self {
        Self {
            verification_status: Some(status),
            ..Self::default()
        }
    }

    pub fn flags(flags: AccountFlags) -> Self {
        Self {
            ai_enabled: Some(flags.ai_enabled),
            auto_reply: Some(flags.auto_reply),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewRoutingMapping {
    pub tenant_id: String,
    pub account_id: i64,
    pub platform: Platform,
    pub external_resource_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingUpdate {
    pub external_resource_id: String,
}

/// Result of the authorization initiation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationInit {
    #[serde(alias = "sessionId")]
    pub session_id: String,
    #[serde(alias = "authorizationUrl", alias = "url")]
    pub authorization_url: String,
}

/// Server-side session status returned by a poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, alias = "pages")]
    pub resources: Option<Vec<ConnectableResource>>,
    #[serde(default, alias = "externalIdentity", alias = "user")]
    pub external_identity: Option<ExternalIdentity>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_str() {
        for p in [
            Platform::Facebook,
            Platform::Instagram,
            Platform::Whatsapp,
            Platform::Telegram,
        ] {
            assert_eq!(Platform::from_str(p.as_str()).unwrap(), p);
        }
        assert_eq!(Platform::from_str("Facebook").unwrap(), Platform::Facebook);
        assert!(Platform::from_str("myspace").is_err());
    }

    #[test]
    fn verification_status_reconnect_set() {
        assert!(VerificationStatus::TokenExpired.requires_reconnect());
        assert!(VerificationStatus::NeedsReconnect.requires_reconnect());
        assert!(VerificationStatus::NeedsCheck.requires_reconnect());
        assert!(!VerificationStatus::Verified.requires_reconnect());
        assert!(!VerificationStatus::Pending.requires_reconnect());
        assert_eq!(
            VerificationStatus::from_str("needs_check").unwrap(),
            VerificationStatus::NeedsCheck
        );
    }

    #[test]
    fn credential_token_is_redacted_in_debug() {
        let resource = ConnectableResource::new("p1", "Acme Page").with_access_token("EAAB-secret");
        let printed = format!("{:?}", resource);
        assert!(!printed.contains("EAAB-secret"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn resource_accepts_camel_case_aliases() {
        let json = r#"{"id":"p1","name":"Acme Page","capabilityTags":["messaging-enabled"]}"#;
        let resource: ConnectableResource = serde_json::from_str(json).unwrap();
        assert_eq!(resource.external_id, "p1");
        assert_eq!(resource.display_name, "Acme Page");
        assert!(resource.capability_tags.contains("messaging-enabled"));
    }

    #[test]
    fn webhook_account_never_serializes_credential() {
        let json = r#"{
            "id": 42,
            "tenant_id": "t1",
            "platform": "facebook",
            "external_resource_id": "p1",
            "display_name": "Acme Page",
            "credential_token": "EAAB-secret",
            "is_active": true,
            "verification_status": "verified",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let account: WebhookAccount = serde_json::from_str(json).unwrap();
        assert_eq!(account.credential_token.as_ref().unwrap().expose(), "EAAB-secret");
        assert!(!account.ai_enabled);

        let out = serde_json::to_string(&account).unwrap();
        assert!(!out.contains("EAAB-secret"));
        assert!(out.contains(r#""verification_status":"verified""#));
    }

    #[test]
    fn account_update_skips_untouched_fields() {
        let update = AccountUpdate::status(VerificationStatus::NeedsReconnect);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({"verification_status": "needs_reconnect"}));
    }

    #[test]
    fn poll_response_not_ready_defaults() {
        let resp: PollResponse = serde_json::from_str(r#"{"ready":false}"#).unwrap();
        assert!(!resp.ready);
        assert!(resp.resources.is_none());
        assert!(resp.error.is_none());
    }

    #[test]
    fn poll_response_accepts_pages_and_user_aliases() {
        let json = r#"{"ready":true,"pages":[{"id":"p1","name":"Acme"}],"user":{"name":"Jo"}}"#;
        let resp: PollResponse = serde_json::from_str(json).unwrap();
        assert!(resp.ready);
        assert_eq!(resp.resources.unwrap().len(), 1);
        assert_eq!(resp.external_identity.unwrap().display_name, "Jo");
    }
}
