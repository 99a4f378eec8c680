use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::mail::{Email, MailError};
use crate::token::TokenPurpose;

/// Replaced by the encoded token in text and html bodies.
pub const TOKEN_PLACEHOLDER: &str = "_TOKEN_PLACEHOLDER_";

/// Message template of one token purpose.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Template {
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
}

impl Template {
    /// Copy of the template with `token` in place of the placeholder.
    pub fn with_token(&self, token: &str) -> Self {
        Self {
            subject: self.subject.clone(),
            text: self.text.replace(TOKEN_PLACEHOLDER, token),
            html: self.html.replace(TOKEN_PLACEHOLDER, token),
        }
    }

    /// Address the template, a message needs a text or html body.
    pub fn apply(self, from: &str, to: &str) -> Result<Email, MailError> {
        if self.text.is_empty() && self.html.is_empty() {
            return Err(MailError::EmptyBody);
        }

        Ok(Email {
            from: from.to_owned(),
            to: to.to_owned(),
            subject: self.subject,
            text: Some(self.text).filter(|text| !text.is_empty()),
            html: Some(self.html).filter(|html| !html.is_empty()),
        })
    }
}

/// Templates of one client domain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct DomainTemplates {
    /// Sender of every message of the domain.
    pub from: String,
    #[serde(default)]
    pub emails: HashMap<TokenPurpose, Template>,
}

impl DomainTemplates {
    pub fn email(&self, purpose: TokenPurpose) -> Option<&Template> {
        self.emails.get(&purpose)
    }
}

/// Templates of every client domain, read from YAML:
///
/// ```yaml
/// example.com:
///   from: Example <no-reply@example.com>
///   emails:
///     EMAIL:
///       subject: Confirm your address
///       text: https://example.com/verify?token=_TOKEN_PLACEHOLDER_
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Templates {
    domains: HashMap<String, DomainTemplates>,
}

impl Templates {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MailError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn parse(yaml: &str) -> Result<Self, MailError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Names of known domains, sorted.
    pub fn domains(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.domains.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn domain(&self, name: &str) -> Option<&DomainTemplates> {
        self.domains.get(name)
    }
}
