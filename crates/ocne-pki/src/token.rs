//! kubeadm bootstrap tokens
//!
//! Tokens have the form `[a-z0-9]{6}.[a-z0-9]{16}`: a public id and a secret.
//! Posting one to the cluster means creating a `bootstrap-token-<id>` Secret in
//! `kube-system`, which is what `kubeadm token create` does.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use tracing::info;

use crate::{PkiError, Result};

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
/// Length of the public token id
pub const TOKEN_ID_LEN: usize = 6;
/// Length of the token secret
pub const TOKEN_SECRET_LEN: usize = 16;
/// How long a posted token stays valid
pub const TOKEN_TTL_HOURS: i64 = 24;
/// Secret type recognised by the bootstrap token authenticator
pub const BOOTSTRAP_TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";
/// Group kubeadm's default node bootstrap RBAC is bound to
pub const BOOTSTRAP_TOKEN_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

/// A kubeadm bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken {
    id: String,
    secret: String,
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken").field("id", &self.id).finish_non_exhaustive()
    }
}

impl std::fmt::Display for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.secret)
    }
}

/// Uniformly random lowercase-alphanumeric string
fn random_token_chars(len: usize) -> Result<String> {
    // bytes >= 252 are rejected so `b % 36` stays uniform
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];
    while out.len() < len {
        aws_lc_rs::rand::fill(&mut buf).map_err(|_| PkiError::Random)?;
        for b in buf {
            if out.len() == len {
                break;
            }
            if b < 252 {
                out.push(TOKEN_CHARSET[(b % 36) as usize] as char);
            }
        }
    }
    Ok(out)
}

impl JoinToken {
    /// Generate a new random token
    pub fn generate() -> Result<Self> {
        Ok(Self {
            id: random_token_chars(TOKEN_ID_LEN)?,
            secret: random_token_chars(TOKEN_SECRET_LEN)?,
        })
    }

    /// Parse `id.secret`
    pub fn parse(s: &str) -> Result<Self> {
        let valid = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| TOKEN_CHARSET.contains(&b))
        };
        match s.split_once('.') {
            Some((id, secret)) if valid(id, TOKEN_ID_LEN) && valid(secret, TOKEN_SECRET_LEN) => {
                Ok(Self {
                    id: id.to_string(),
                    secret: secret.to_string(),
                })
            }
            _ => Err(PkiError::Parse(
                "bootstrap token must match [a-z0-9]{6}.[a-z0-9]{16}".to_string(),
            )),
        }
    }

    /// Public token id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token secret
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Name of the Secret carrying this token
    pub fn secret_name(&self) -> String {
        format!("bootstrap-token-{}", self.id)
    }

    /// The bootstrap-token Secret, expiring `TOKEN_TTL_HOURS` after `now`
    pub fn to_secret(&self, now: chrono::DateTime<chrono::Utc>) -> Secret {
        let expiration = now + chrono::Duration::hours(TOKEN_TTL_HOURS);
        let data = BTreeMap::from([
            ("token-id".to_string(), self.id.clone()),
            ("token-secret".to_string(), self.secret.clone()),
            (
                "expiration".to_string(),
                expiration.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
            ("usage-bootstrap-authentication".to_string(), "true".to_string()),
            ("usage-bootstrap-signing".to_string(), "true".to_string()),
            ("auth-extra-groups".to_string(), BOOTSTRAP_TOKEN_GROUP.to_string()),
            ("description".to_string(), "Join token created by ocne".to_string()),
        ]);
        Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name()),
                namespace: Some(ocne_common::KUBE_SYSTEM_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: Some(BOOTSTRAP_TOKEN_SECRET_TYPE.to_string()),
            string_data: Some(data),
            ..Default::default()
        }
    }
}

/// Generate a join token and, unless `generate_only`, post it to the cluster
pub async fn create_join_token(
    kubeconfig: &Path,
    generate_only: bool,
) -> ocne_common::Result<JoinToken> {
    let token = JoinToken::generate()?;
    if generate_only {
        return Ok(token);
    }

    let client = ocne_common::kube_utils::create_client(Some(kubeconfig)).await?;
    let secrets: Api<Secret> =
        Api::namespaced(client, ocne_common::KUBE_SYSTEM_NAMESPACE);
    secrets
        .create(&PostParams::default(), &token.to_secret(chrono::Utc::now()))
        .await
        .map_err(|e| ocne_common::Error::from(e).with_context("creating bootstrap token"))?;
    info!(token_id = %token.id(), "Created bootstrap token");
    Ok(token)
}
