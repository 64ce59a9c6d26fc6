use regex::Regex;
use std::sync::OnceLock;

use crate::db::FieldKind;

/// Ceiling for free-text values (TEXT, TEXTAREA).
pub const TEXT_MAX_LEN: usize = 10_000;

/// Ceiling for a single choice value, and for each token of a multi-select.
pub const CHOICE_MAX_LEN: usize = 500;

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();

fn email_re() -> &'static Regex {
    EMAIL_RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"))
}

/// Normalize a raw client value. Surrounding whitespace is stripped; an
/// empty result means "field cleared" and skips type validation.
pub fn normalize(raw: &str) -> String {
    raw.trim().to_string()
}

/// Validate a non-empty, normalized value against the field's declared kind.
pub fn validate_value(kind: FieldKind, value: &str) -> Result<(), String> {
    match kind {
        FieldKind::Email => {
            if !email_re().is_match(value) {
                return Err("not a valid email address".to_string());
            }
        }
        FieldKind::Number => {
            let parsed: f64 = value
                .parse()
                .map_err(|_| "not a valid number".to_string())?;
            if !parsed.is_finite() {
                return Err("not a finite number".to_string());
            }
        }
        FieldKind::Text | FieldKind::Textarea => {
            if value.chars().count() > TEXT_MAX_LEN {
                return Err(format!("text exceeds {} characters", TEXT_MAX_LEN));
            }
        }
        FieldKind::Select | FieldKind::Radio => {
            if value.chars().count() > CHOICE_MAX_LEN {
                return Err(format!("choice exceeds {} characters", CHOICE_MAX_LEN));
            }
        }
        FieldKind::Checkbox => {
            // Multi-select values arrive as comma-separated tokens.
            for token in value.split(',') {
                if token.trim().chars().count() > CHOICE_MAX_LEN {
                    return Err(format!(
                        "selected option exceeds {} characters",
                        CHOICE_MAX_LEN
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_whitespace() {
        assert_eq!(normalize("  Ada \n"), "Ada");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn accepts_plausible_emails() {
        assert!(validate_value(FieldKind::Email, "ada@example.com").is_ok());
        assert!(validate_value(FieldKind::Email, "a.b+tag@sub.domain.org").is_ok());
    }

    #[test]
    fn rejects_malformed_emails() {
        for bad in ["not-an-email", "a@b", "a @b.com", "a@b .com", "@b.com"] {
            assert!(
                validate_value(FieldKind::Email, bad).is_err(),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn number_must_be_finite() {
        assert!(validate_value(FieldKind::Number, "42").is_ok());
        assert!(validate_value(FieldKind::Number, "-3.5e2").is_ok());
        assert!(validate_value(FieldKind::Number, "twelve").is_err());
        assert!(validate_value(FieldKind::Number, "NaN").is_err());
        assert!(validate_value(FieldKind::Number, "inf").is_err());
    }

    #[test]
    fn text_length_ceiling_is_inclusive() {
        let at_limit = "x".repeat(TEXT_MAX_LEN);
        let over_limit = "x".repeat(TEXT_MAX_LEN + 1);
        assert!(validate_value(FieldKind::Text, &at_limit).is_ok());
        assert!(validate_value(FieldKind::Textarea, &at_limit).is_ok());
        assert!(validate_value(FieldKind::Text, &over_limit).is_err());
    }

    #[test]
    fn choice_length_ceiling() {
        let at_limit = "x".repeat(CHOICE_MAX_LEN);
        let over_limit = "x".repeat(CHOICE_MAX_LEN + 1);
        assert!(validate_value(FieldKind::Select, &at_limit).is_ok());
        assert!(validate_value(FieldKind::Radio, &over_limit).is_err());
    }

    #[test]
    fn multi_select_checks_each_token() {
        let long = "x".repeat(CHOICE_MAX_LEN + 1);
        assert!(validate_value(FieldKind::Checkbox, "red, green, blue").is_ok());
        assert!(validate_value(FieldKind::Checkbox, &format!("red, {}", long)).is_err());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        // Multibyte characters count once each.
        let value = "ü".repeat(CHOICE_MAX_LEN);
        assert!(validate_value(FieldKind::Select, &value).is_ok());
    }
}
