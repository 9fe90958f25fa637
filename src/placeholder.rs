//! Placeholder substitution.
//!
//! Manifests reference cluster identity through tokens such as
//! `${ACCOUNT_ID}` or `$ACCOUNT_ID`. A [`Modifier`] carries the values
//! resolved at start-up and rewrites any document that mentions them.

use std::borrow::Cow;
use std::fmt;

use regex::{Captures, Regex};
use tracing::warn;

use crate::{Error, Result};

/// The four kinds of placeholder a document may reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placeholder {
    AccountId,
    Region,
    ClusterName,
    OidcProvider,
}

impl Placeholder {
    pub const ALL: [Placeholder; 4] = [
        Placeholder::Region,
        Placeholder::AccountId,
        Placeholder::ClusterName,
        Placeholder::OidcProvider,
    ];

    /// Token name as it appears after the `$`
    pub fn token(self) -> &'static str {
        match self {
            Placeholder::AccountId => "ACCOUNT_ID",
            Placeholder::Region => "AWS_REGION",
            Placeholder::ClusterName => "CLUSTER_NAME",
            Placeholder::OidcProvider => "OIDC_PROVIDER",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Placeholder::ALL.into_iter().find(|p| p.token() == token)
    }

    /// Single pattern matching every token in either spelling
    fn combined_pattern() -> Result<Regex> {
        let tokens = Placeholder::ALL.map(Placeholder::token).join("|");
        Regex::new(&format!(r"\$\{{(?P<braced>{tokens})\}}|\$(?P<bare>{tokens})"))
            .map_err(|e| Error::Config(format!("invalid placeholder pattern: {e}")))
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Resolved substitution values plus their compiled pattern.
///
/// Built once at start-up and shared read-only between request handlers.
#[derive(Clone, Debug)]
pub struct Modifier {
    account_id: String,
    region: String,
    cluster_name: String,
    oidc_provider: String,
    combined: Regex,
}

impl Modifier {
    pub fn builder() -> ModifierBuilder {
        ModifierBuilder::default()
    }

    /// The configured value for a placeholder kind
    pub fn value(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::AccountId => &self.account_id,
            Placeholder::Region => &self.region,
            Placeholder::ClusterName => &self.cluster_name,
            Placeholder::OidcProvider => &self.oidc_provider,
        }
    }

    /// Apply all four substitutions, reporting whether anything changed.
    ///
    /// Runs as a single scan so substituted values are never re-scanned for tokens.
    pub fn replace_placeholders(&self, doc: &str) -> (String, bool) {
        match self
            .combined
            .replace_all(doc, |caps: &Captures<'_>| self.captured_value(caps))
        {
            Cow::Owned(updated) => (updated, true),
            Cow::Borrowed(_) => (doc.to_owned(), false),
        }
    }

    fn captured_value<'s>(&'s self, caps: &Captures<'_>) -> &'s str {
        caps.name("braced")
            .or_else(|| caps.name("bare"))
            .and_then(|m| Placeholder::from_token(m.as_str()))
            .map(|p| self.value(p))
            .unwrap_or_default()
    }
}

/// Named-field builder for [`Modifier`]; every value must be set explicitly
#[derive(Clone, Debug, Default)]
pub struct ModifierBuilder {
    account_id: Option<String>,
    region: Option<String>,
    cluster_name: Option<String>,
    oidc_provider: Option<String>,
}

impl ModifierBuilder {
    pub fn account_id(mut self, value: impl Into<String>) -> Self {
        self.account_id = Some(value.into());
        self
    }

    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = Some(value.into());
        self
    }

    pub fn cluster_name(mut self, value: impl Into<String>) -> Self {
        self.cluster_name = Some(value.into());
        self
    }

    pub fn oidc_provider(mut self, value: impl Into<String>) -> Self {
        self.oidc_provider = Some(value.into());
        self
    }

    pub fn build(self) -> Result<Modifier> {
        let required = |value: Option<String>, placeholder: Placeholder| {
            let value = value.ok_or_else(|| {
                Error::Config(format!("no value configured for {placeholder}"))
            })?;
            if value.is_empty() {
                warn!(placeholder = %placeholder, "placeholder will be replaced with an empty value");
            }
            Ok::<_, Error>(value)
        };

        let account_id = required(self.account_id, Placeholder::AccountId)?;
        let region = required(self.region, Placeholder::Region)?;
        let cluster_name = required(self.cluster_name, Placeholder::ClusterName)?;
        let oidc_provider = required(self.oidc_provider, Placeholder::OidcProvider)?;

        let combined = Placeholder::combined_pattern()?;

        Ok(Modifier {
            account_id,
            region,
            cluster_name,
            oidc_provider,
            combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT_ID: &str = "123456789012";
    const CLUSTER_OIDC: &str = "oidc.eks.eu-west-1.amazonaws.com/id/6A0A07D566C756AECD797B338FAA4A4D";

    fn modifier() -> Modifier {
        Modifier::builder()
            .account_id(ACCOUNT_ID)
            .region("eu-west-1")
            .cluster_name("blue")
            .oidc_provider(CLUSTER_OIDC)
            .build()
            .unwrap()
    }

    #[test]
    fn replaces_both_spellings_everywhere() {
        let m = modifier();
        let (doc, changed) =
            m.replace_placeholders("arn:aws:iam::${ACCOUNT_ID}:role/a,arn:aws:iam::$ACCOUNT_ID:role/b");
        assert!(changed);
        assert_eq!(
            doc,
            "arn:aws:iam::123456789012:role/a,arn:aws:iam::123456789012:role/b"
        );
    }

    #[test]
    fn leaves_documents_without_tokens_alone() {
        let m = modifier();
        let original = "arn:aws:iam::210987654321:role/static";
        let (doc, changed) = m.replace_placeholders(original);
        assert!(!changed);
        assert_eq!(doc, original);
    }

    #[test]
    fn replaces_every_kind_in_one_pass() {
        let m = modifier();
        let (doc, changed) = m.replace_placeholders(
            "${AWS_REGION}/$CLUSTER_NAME/${ACCOUNT_ID}/$OIDC_PROVIDER:sub",
        );
        assert!(changed);
        assert_eq!(doc, format!("eu-west-1/blue/{ACCOUNT_ID}/{CLUSTER_OIDC}:sub"));
    }

    #[test]
    fn substitution_is_idempotent() {
        let m = modifier();
        let (once, _) = m.replace_placeholders("${OIDC_PROVIDER}:aud ${ACCOUNT_ID}");
        let (twice, changed) = m.replace_placeholders(&once);
        assert_eq!(once, twice);
        assert!(!changed);
    }

    #[test]
    fn values_are_inserted_literally() {
        let m = Modifier::builder()
            .account_id("$CLUSTER_NAME")
            .region("${1}")
            .cluster_name("blue")
            .oidc_provider("")
            .build()
            .unwrap();

        // "${1}" must not be expanded as a capture group reference
        let (doc, _) = m.replace_placeholders("r=${AWS_REGION} r=$AWS_REGION");
        assert_eq!(doc, "r=${1} r=${1}");

        // a value that looks like a token is not substituted again
        let (doc, changed) = m.replace_placeholders("${ACCOUNT_ID}");
        assert!(changed);
        assert_eq!(doc, "$CLUSTER_NAME");
    }

    #[test]
    fn empty_values_are_still_substituted() {
        let m = Modifier::builder()
            .account_id(ACCOUNT_ID)
            .region("eu-west-1")
            .cluster_name("blue")
            .oidc_provider("")
            .build()
            .unwrap();
        let (doc, changed) = m.replace_placeholders("${OIDC_PROVIDER}:aud");
        assert!(changed);
        assert_eq!(doc, ":aud");
    }

    #[test]
    fn tokens_map_back_to_placeholders() {
        for placeholder in Placeholder::ALL {
            assert_eq!(Placeholder::from_token(placeholder.token()), Some(placeholder));
        }
        assert_eq!(Placeholder::from_token("ACCOUNT"), None);
    }

    #[test]
    fn builder_requires_every_value() {
        let err = Modifier::builder()
            .account_id(ACCOUNT_ID)
            .region("eu-west-1")
            .oidc_provider(CLUSTER_OIDC)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("CLUSTER_NAME"));
    }
}
