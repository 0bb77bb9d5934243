use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::validator::is_email_shaped;

pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_LABEL_LEN: usize = 100;
pub const MAX_METADATA_KEYS: usize = 10;
pub const DEFAULT_SOURCE: &str = "website";

/// Disposable mailbox providers rejected at capture time.
pub const BLOCKED_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "guerrillamail.com",
    "mailinator.com",
    "tempmail.org",
    "temp-mail.org",
    "throwaway.email",
    "yopmail.com",
    "trashmail.com",
    "getnada.com",
    "sharklasers.com",
    "dispostable.com",
    "maildrop.cc",
];

/// Subscription status persisted with each lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    Active,
    Unsubscribed,
}

impl LeadStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "unsubscribed" => Self::Unsubscribed,
            _ => Self::Active,
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw body accepted by the capture endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Input that passed validation, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidCapture {
    /// Dedup key.
    pub email: String,
    /// Trimmed address as submitted.
    pub original_email: String,
    pub domain: String,
    pub source: String,
    pub campaign: Option<String>,
    pub metadata: Map<String, Value>,
}

/// User-correctable problems with a capture request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureRejection {
    #[error("Email is required")]
    MissingEmail,
    #[error("Invalid email format")]
    InvalidEmail,
    #[error("Email is too long (max 254 characters)")]
    EmailTooLong,
    #[error("Source is too long (max 100 characters)")]
    SourceTooLong,
    #[error("Campaign is too long (max 100 characters)")]
    CampaignTooLong,
    #[error("Metadata cannot have more than 10 keys")]
    TooManyMetadataKeys,
    #[error("Disposable email addresses are not allowed")]
    BlockedDomain,
}

impl CaptureRejection {
    /// Stable machine-readable code used in responses and analytics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingEmail => "missing_email",
            Self::InvalidEmail => "invalid_email",
            Self::EmailTooLong => "email_too_long",
            Self::SourceTooLong => "source_too_long",
            Self::CampaignTooLong => "campaign_too_long",
            Self::TooManyMetadataKeys => "too_many_metadata_keys",
            Self::BlockedDomain => "blocked_domain",
        }
    }

    pub fn is_blocked_domain(&self) -> bool {
        matches!(self, Self::BlockedDomain)
    }
}

impl CaptureRequest {
    /// Validates shape and limits, normalizes the address and applies the
    /// disposable-domain blocklist.
    pub fn validate(self) -> Result<ValidCapture, CaptureRejection> {
        let original_email = self
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .ok_or(CaptureRejection::MissingEmail)?
            .to_string();

        if original_email.chars().count() > MAX_EMAIL_LEN {
            return Err(CaptureRejection::EmailTooLong);
        }
        if !is_email_shaped(&original_email) {
            return Err(CaptureRejection::InvalidEmail);
        }

        let source = match self.source.as_deref().map(str::trim) {
            Some(source) if source.chars().count() > MAX_LABEL_LEN => {
                return Err(CaptureRejection::SourceTooLong)
            }
            Some(source) if !source.is_empty() => source.to_string(),
            _ => DEFAULT_SOURCE.to_string(),
        };

        let campaign = match self.campaign.as_deref().map(str::trim) {
            Some(campaign) if campaign.chars().count() > MAX_LABEL_LEN => {
                return Err(CaptureRejection::CampaignTooLong)
            }
            Some(campaign) if !campaign.is_empty() => Some(campaign.to_string()),
            _ => None,
        };

        let metadata = self.metadata.unwrap_or_default();
        if metadata.len() > MAX_METADATA_KEYS {
            return Err(CaptureRejection::TooManyMetadataKeys);
        }

        let email = normalize_email(&original_email).ok_or(CaptureRejection::InvalidEmail)?;
        let domain = email_domain(&email).unwrap_or_default().to_string();
        if is_blocked_domain(&domain) {
            return Err(CaptureRejection::BlockedDomain);
        }

        Ok(ValidCapture {
            email,
            original_email,
            domain,
            source,
            campaign,
            metadata,
        })
    }
}

/// Provider-aware canonical form of an address.
///
/// Everything is lower-cased. Gmail ignores dots and `+tags` and treats
/// `googlemail.com` as `gmail.com`; Microsoft and Apple mailboxes drop
/// `+tags`; Yahoo drops `-tags`. Returns `None` when the input has no `@`.
pub fn normalize_email(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let (local, domain) = lowered.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }

    let (local, domain) = match domain {
        "gmail.com" | "googlemail.com" => {
            let base = strip_tag(local, '+').replace('.', "");
            (base, "gmail.com")
        }
        "outlook.com" | "hotmail.com" | "live.com" | "msn.com" | "icloud.com" | "me.com"
        | "mac.com" => (strip_tag(local, '+').to_string(), domain),
        "yahoo.com" | "ymail.com" | "rocketmail.com" => {
            (strip_tag(local, '-').to_string(), domain)
        }
        _ => (local.to_string(), domain),
    };

    if local.is_empty() {
        return None;
    }
    Some(format!("{local}@{domain}"))
}

fn strip_tag(local: &str, separator: char) -> &str {
    local.split(separator).next().unwrap_or(local)
}

pub fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain)
}

/// Matches the domain itself or any subdomain of a blocked provider.
pub fn is_blocked_domain(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    BLOCKED_DOMAINS.iter().any(|blocked| {
        domain == *blocked
            || domain
                .strip_suffix(blocked)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}
