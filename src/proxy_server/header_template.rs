//! A minimal `{{ .Session.Field }}` substitution engine for per-upstream
//! request header templates. The expression surface is field access only,
//! so a small precompiled substituter is all the design calls for.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::cookies::Session;

static FIELD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*\.Session\.(\w+)\s*\}\}").expect("static regex compiles"));

/// A header-value template, precompiled once at startup from its source
/// string. Rendering never fails on unknown fields — it renders an empty
/// string, matching a missing map key rather than erroring.
#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    source: String,
}

impl HeaderTemplate {
    pub fn compile(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn render(&self, session: &Session) -> String {
        FIELD_PATTERN
            .replace_all(&self.source, |caps: &regex::Captures| {
                field_value(session, &caps[1])
            })
            .into_owned()
    }
}

fn field_value(session: &Session, field: &str) -> String {
    match field {
        "User" | "user" => session.user.clone(),
        "Authorized" | "authorized" => session.authorized.to_string(),
        "ExpiresAt" | "expires_at" => session.expires_at.to_string(),
        _ => String::new(),
    }
}
