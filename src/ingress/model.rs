//! Ingress entity persisted under `ingresses/<id>.json` (`spec.md` §4.6, §6).

use serde::{Deserialize, Serialize};

/// One `(hostname|pattern, port)` -> `(instance, port)` mapping within an
/// [`Ingress`]. `hostname_pattern` may contain one capture per label (e.g.
/// `{instance}.example.com`); `target_instance` may reference any capture
/// defined in the pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub hostname_pattern: String,
    pub listen_port: u16,
    pub target_instance: String,
    pub target_port: u16,
    pub tls: bool,
    /// Redirect plain HTTP on port 80 to this rule's HTTPS listener.
    pub http_redirect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingress {
    pub id: String,
    pub name: String,
    pub rules: Vec<Rule>,
    pub created_at: String,
}

/// Request body for [`super::IngressManager::create`].
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub rules: Vec<Rule>,
}
