use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static EMAIL_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex compiles"));

static PHONE_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+]?[\d\s\-().]{7,20}$").expect("phone regex compiles"));

/// Outcome of running one validator against a raw field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Verdict {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }
}

/// Named field validators understood by form sessions.
///
/// Names are parsed leniently: an unrecognised name maps to [`Rule::Unknown`]
/// which always passes, so a typo in a form declaration never blocks a submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Email,
    Required,
    Name,
    Phone,
    MinLength(usize),
    Unknown(String),
}

impl Rule {
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        match name {
            "email" => Self::Email,
            "required" => Self::Required,
            "name" => Self::Name,
            "phone" => Self::Phone,
            other => match other
                .strip_prefix("minlength:")
                .and_then(|n| n.trim().parse::<usize>().ok())
            {
                Some(min) => Self::MinLength(min),
                None => Self::Unknown(other.to_string()),
            },
        }
    }

    pub fn check(&self, raw: &str) -> Verdict {
        match self {
            Self::Email => email(raw),
            Self::Required => required(raw),
            Self::Name => name(raw),
            Self::Phone => phone(raw),
            Self::MinLength(min) => min_length(raw, *min),
            Self::Unknown(_) => Verdict::ok(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

pub fn email(raw: &str) -> Verdict {
    if EMAIL_SHAPE.is_match(raw.trim()) {
        Verdict::ok()
    } else {
        Verdict::fail("Please enter a valid email address")
    }
}

pub fn required(raw: &str) -> Verdict {
    if raw.trim().is_empty() {
        Verdict::fail("This field is required")
    } else {
        Verdict::ok()
    }
}

pub fn name(raw: &str) -> Verdict {
    if raw.trim().chars().count() >= 2 {
        Verdict::ok()
    } else {
        Verdict::fail("Name must be at least 2 characters")
    }
}

/// Empty input passes; phone numbers are optional on every form.
pub fn phone(raw: &str) -> Verdict {
    let trimmed = raw.trim();
    if trimmed.is_empty() || PHONE_SHAPE.is_match(trimmed) {
        Verdict::ok()
    } else {
        Verdict::fail("Please enter a valid phone number")
    }
}

pub fn min_length(raw: &str, min: usize) -> Verdict {
    if raw.trim().chars().count() >= min {
        Verdict::ok()
    } else {
        Verdict::fail(format!("Must be at least {min} characters"))
    }
}

/// Returns `true` when the value has the shape of an email address.
pub fn is_email_shaped(raw: &str) -> bool {
    EMAIL_SHAPE.is_match(raw)
}

/// Runs every rule in order and returns the first failure.
pub fn run_all(rules: &[Rule], raw: &str) -> Verdict {
    rules
        .iter()
        .map(|rule| rule.check(raw))
        .find(|verdict| !verdict.valid)
        .unwrap_or_else(Verdict::ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_emails() {
        for value in [
            "user@example.com",
            "first.last+tag@sub.domain.org",
            "  padded@example.io  ",
            "x@y.co",
        ] {
            assert!(email(value).valid, "{value} should be valid");
        }
    }

    #[test]
    fn rejects_emails_without_at_or_domain() {
        for value in [
            "",
            "plainaddress",
            "missing-at.example.com",
            "user@",
            "user@domain",
            "@example.com",
            "two words@example.com",
        ] {
            let verdict = email(value);
            assert!(!verdict.valid, "{value} should be invalid");
            assert!(verdict.message.is_some());
        }
    }

    #[test]
    fn required_trims_whitespace() {
        assert!(!required("   ").valid);
        assert!(required(" a ").valid);
    }

    #[test]
    fn name_needs_two_characters_after_trim() {
        assert!(!name(" J ").valid);
        assert!(name("Jo").valid);
        assert!(name("Zoë").valid);
    }

    #[test]
    fn phone_is_permissive_and_optional() {
        assert!(phone("").valid);
        assert!(phone("+1 (555) 123-4567").valid);
        assert!(phone("555.123.4567").valid);
        assert!(!phone("call me").valid);
        assert!(!phone("12").valid);
    }

    #[test]
    fn parses_rule_names() {
        assert_eq!(Rule::parse("email"), Rule::Email);
        assert_eq!(Rule::parse(" phone "), Rule::Phone);
        assert_eq!(Rule::parse("minlength:8"), Rule::MinLength(8));
        assert_eq!(
            Rule::parse("zipcode"),
            Rule::Unknown("zipcode".to_string())
        );
    }

    #[test]
    fn unknown_rules_always_pass() {
        let rule = Rule::parse("does-not-exist");
        assert!(!rule.is_known());
        assert!(rule.check("").valid);
    }

    #[test]
    fn run_all_reports_first_failure() {
        let rules = [Rule::Required, Rule::Email];
        assert_eq!(
            run_all(&rules, "").message.as_deref(),
            Some("This field is required")
        );
        assert_eq!(
            run_all(&rules, "nope").message.as_deref(),
            Some("Please enter a valid email address")
        );
        assert!(run_all(&rules, "a@b.co").valid);
    }
}
