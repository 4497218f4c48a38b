use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label ArgoCD uses to discover repository credentials.
pub const ARGOCD_SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";

/// Default value of the `username` field.
pub const DEFAULT_USERNAME: &str = "x-access-token";

/// Format of the Secret the token is written into.
///
/// The kind fully determines which labels and `stringData` keys are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecretKind {
    /// Git basic-auth credential: `username` and `password`.
    #[default]
    Git,
    /// The raw token under `token`.
    Plain,
    /// ArgoCD repository Secret.
    ArgoCd,
    /// ArgoCD credential template (`repo-creds`) Secret.
    ArgoCdTemplate,
}

impl SecretKind {
    pub const ALL: [SecretKind; 4] = [
        SecretKind::Git,
        SecretKind::Plain,
        SecretKind::ArgoCd,
        SecretKind::ArgoCdTemplate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Git => "git",
            SecretKind::Plain => "plain",
            SecretKind::ArgoCd => "argocd",
            SecretKind::ArgoCdTemplate => "argocd-template",
        }
    }

    /// Whether the kind needs `argocd_type` and `argocd_url`.
    pub fn is_argocd(&self) -> bool {
        matches!(self, SecretKind::ArgoCd | SecretKind::ArgoCdTemplate)
    }

    /// Value of the ArgoCD secret-type label, if this kind sets one.
    pub fn argocd_secret_type(&self) -> Option<&'static str> {
        match self {
            SecretKind::ArgoCd => Some("repository"),
            SecretKind::ArgoCdTemplate => Some("repo-creds"),
            SecretKind::Git | SecretKind::Plain => None,
        }
    }

    /// Build the labels and `stringData` this kind writes for `token`.
    pub fn desired(&self, token: &str, fields: &SecretFields) -> DesiredSecret {
        let mut labels = BTreeMap::new();
        if let Some(secret_type) = self.argocd_secret_type() {
            labels.insert(ARGOCD_SECRET_TYPE_LABEL.to_owned(), secret_type.to_owned());
        }

        let string_data = match self {
            SecretKind::Git => BTreeMap::from([
                ("username".to_owned(), fields.username.clone()),
                ("password".to_owned(), token.to_owned()),
            ]),
            SecretKind::Plain => BTreeMap::from([("token".to_owned(), token.to_owned())]),
            SecretKind::ArgoCd | SecretKind::ArgoCdTemplate => BTreeMap::from([
                ("username".to_owned(), fields.username.clone()),
                ("password".to_owned(), token.to_owned()),
                ("type".to_owned(), fields.argocd_type.clone()),
                ("url".to_owned(), fields.argocd_url.clone()),
            ]),
        };

        DesiredSecret {
            labels,
            string_data,
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid secret type {0:?} (expected one of git, plain, argocd, argocd-template)")]
pub struct UnknownSecretKind(pub String);

impl FromStr for SecretKind {
    type Err = UnknownSecretKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SecretKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownSecretKind(s.to_owned()))
    }
}

/// Auxiliary values written next to the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFields {
    pub username: String,
    /// ArgoCD repository type (`git`, `helm`, ...).
    pub argocd_type: String,
    pub argocd_url: String,
}

impl Default for SecretFields {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.into(),
            argocd_type: "git".into(),
            argocd_url: String::new(),
        }
    }
}

/// Labels and `stringData` a kind owns on the target Secret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSecret {
    pub labels: BTreeMap<String, String>,
    pub string_data: BTreeMap<String, String>,
}
