//! Ingress router supervisor: generated Caddy config, admin-API reloads,
//! and the embedded internal DNS server (`spec.md` §4.6, C11).

pub mod caddy;
pub mod config;
pub mod dns;
pub mod model;
pub mod pattern;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

pub use model::{CreateRequest, Ingress, Rule};

use crate::error::{EntityKind, HypemanError, Result};
use crate::paths::DataRoot;
use pattern::HostPattern;

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("io error: {0}")]
    Io(std::io::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid ingress config: {0}")]
    InvalidConfig(String),

    #[error("proxy admin api unreachable")]
    ProxyUnreachable,

    #[error("proxy rejected config: {message}")]
    ProxyRejected { message: String, port_in_use: bool },
}

impl IngressError {
    pub fn classify(self) -> HypemanError {
        match self {
            IngressError::InvalidConfig(m) => HypemanError::InvalidRequest(m),
            IngressError::ProxyUnreachable => HypemanError::Transient(self.to_string()),
            IngressError::ProxyRejected { message, port_in_use } => {
                HypemanError::ConfigValidationFailed { message, port_in_use }
            }
            other => HypemanError::Internal(other.to_string()),
        }
    }
}

/// Narrow capability the instance manager implements so the embedded DNS
/// resolver can answer `<instance>.<suffix>` queries at request time
/// without caching (`spec.md` §4.6, §9).
#[async_trait::async_trait]
pub trait IngressView: Send + Sync {
    async fn resolve_ip(&self, instance_name_or_id: &str) -> Option<Ipv4Addr>;
    async fn instance_exists(&self, instance_name_or_id: &str) -> bool;
}

pub struct IngressManager {
    data_root: DataRoot,
    ingresses: RwLock<HashMap<String, Ingress>>,
    write_lock: tokio::sync::Mutex<()>,
    allowed_domains: String,
    dns_suffix: String,
    dns_listen_address: String,
    acme_email: Option<String>,
}

impl IngressManager {
    pub fn new(
        data_root: DataRoot,
        allowed_domains: String,
        dns_suffix: String,
        dns_listen_address: String,
        acme_email: Option<String>,
    ) -> Self {
        Self {
            data_root,
            ingresses: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            allowed_domains,
            dns_suffix,
            dns_listen_address,
            acme_email,
        }
    }

    pub async fn load_all(&self) -> Result<()> {
        let dir = self.data_root.ingresses_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        let mut ingresses = self.ingresses.write().await;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(ingress) = crate::paths::try_read_json::<Ingress>(&path).await? {
                ingresses.insert(ingress.id.clone(), ingress);
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Ingress> {
        let id = self.resolve_id(id).await?;
        self.ingresses
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| HypemanError::not_found(EntityKind::Ingress, id))
    }

    /// Exact id, then unambiguous id-prefix, per the same resolution rule
    /// `spec.md` §4.1 describes for instances, applied here for `spec.md`
    /// §8 scenario 2.
    async fn resolve_id(&self, id_or_prefix: &str) -> Result<String> {
        let ingresses = self.ingresses.read().await;
        if ingresses.contains_key(id_or_prefix) {
            return Ok(id_or_prefix.to_string());
        }
        let matches: Vec<String> = ingresses
            .keys()
            .filter(|id| id.starts_with(id_or_prefix))
            .cloned()
            .collect();
        match matches.len() {
            0 => Err(HypemanError::not_found(EntityKind::Ingress, id_or_prefix)),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(HypemanError::Ambiguous {
                prefix: id_or_prefix.to_string(),
                candidates: matches,
            }),
        }
    }

    pub async fn list(&self) -> Vec<Ingress> {
        self.ingresses.read().await.values().cloned().collect()
    }

    fn validate_rules(&self, rules: &[Rule]) -> Result<()> {
        if rules.is_empty() {
            return Err(HypemanError::InvalidRequest(
                "ingress must have at least one rule".into(),
            ));
        }
        for rule in rules {
            let pattern = HostPattern::parse(&rule.hostname_pattern)
                .map_err(|e| HypemanError::InvalidRequest(e.to_string()))?;
            pattern
                .resolve_target(&rule.target_instance)
                .map_err(|e| HypemanError::InvalidRequest(e.to_string()))?;
            if rule.tls && self.acme_email.is_none() {
                return Err(HypemanError::InvalidRequest(
                    "rule requests tls but no ACME_EMAIL/TLS configuration is present".into(),
                ));
            }
            if !pattern::hostname_allowed(&rule.hostname_pattern, &self.allowed_domains) {
                return Err(HypemanError::InvalidRequest(format!(
                    "hostname {:?} is not within the allowed-domains list",
                    rule.hostname_pattern
                )));
            }
        }
        Ok(())
    }

    fn check_port_conflicts(&self, existing: &HashMap<String, Ingress>, rules: &[Rule]) -> Result<()> {
        let mut seen: Vec<(&str, u16)> = Vec::new();
        for ingress in existing.values() {
            for rule in &ingress.rules {
                seen.push((rule.hostname_pattern.as_str(), rule.listen_port));
            }
        }
        for rule in rules {
            let key = (rule.hostname_pattern.as_str(), rule.listen_port);
            if seen.contains(&key) {
                return Err(HypemanError::in_use(
                    EntityKind::Ingress,
                    format!("{}:{}", rule.hostname_pattern, rule.listen_port),
                    "hostname and port already claimed by another ingress rule",
                ));
            }
            seen.push(key);
        }
        Ok(())
    }

    /// Creates an ingress, per `spec.md` §4.6's validation order: syntax,
    /// name uniqueness, TLS-configuration presence, allowed-domain
    /// membership, literal-hostname instance existence, port uniqueness,
    /// full-config generation, proxy load, and only then persistence.
    pub async fn create(
        &self,
        req: CreateRequest,
        caddy: &caddy::CaddySupervisor,
        view: &dyn IngressView,
    ) -> Result<Ingress> {
        let _guard = self.write_lock.lock().await;

        self.validate_rules(&req.rules)?;

        {
            let ingresses = self.ingresses.read().await;
            if ingresses.values().any(|i| i.name == req.name) {
                return Err(HypemanError::already_exists(EntityKind::Ingress, req.name.clone()));
            }
            self.check_port_conflicts(&ingresses, &req.rules)?;
        }

        for rule in &req.rules {
            let pattern = HostPattern::parse(&rule.hostname_pattern)
                .map_err(|e| HypemanError::InvalidRequest(e.to_string()))?;
            if pattern.is_literal() && !view.instance_exists(&rule.target_instance).await {
                return Err(HypemanError::not_found(EntityKind::Instance, rule.target_instance.clone()));
            }
        }

        let ingress = Ingress {
            id: crate::new_id(),
            name: req.name,
            rules: req.rules,
            created_at: crate::now_rfc3339(),
        };

        let all: Vec<Ingress> = self.ingresses.read().await.values().cloned().collect();
        let generated = config::build(
            &all,
            Some(&ingress.rules),
            &self.dns_suffix,
            &self.dns_listen_address,
            self.acme_email.as_deref(),
        );
        caddy.load(&generated).await.map_err(|e| e.classify())?;

        crate::paths::write_json(&self.data_root.ingress_path(&ingress.id), &ingress).await?;
        self.ingresses.write().await.insert(ingress.id.clone(), ingress.clone());
        info!(ingress = %ingress.id, name = %ingress.name, "ingress created");
        Ok(ingress)
    }

    /// Deletes an ingress and reloads the proxy with it removed.
    pub async fn delete(&self, id_or_prefix: &str, caddy: &caddy::CaddySupervisor) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let id = self.resolve_id(id_or_prefix).await?;

        let remaining: Vec<Ingress> = {
            let ingresses = self.ingresses.read().await;
            ingresses.values().filter(|i| i.id != id).cloned().collect()
        };
        let generated = config::build(
            &remaining,
            None,
            &self.dns_suffix,
            &self.dns_listen_address,
            self.acme_email.as_deref(),
        );
        caddy.load(&generated).await.map_err(|e| e.classify())?;

        self.ingresses.write().await.remove(&id);
        tokio::fs::remove_file(self.data_root.ingress_path(&id)).await.ok();
        info!(ingress = %id, "ingress deleted");
        Ok(())
    }

    /// Rebuilds and reloads the full proxy config from whatever is
    /// currently persisted, used once at startup after [`Self::load_all`].
    pub async fn reload_all(&self, caddy: &caddy::CaddySupervisor) -> Result<()> {
        let all: Vec<Ingress> = self.ingresses.read().await.values().cloned().collect();
        if all.is_empty() {
            return Ok(());
        }
        let generated = config::build(&all, None, &self.dns_suffix, &self.dns_listen_address, self.acme_email.as_deref());
        caddy.load(&generated).await.map_err(|e| e.classify())
    }
}

/// Spawns the embedded DNS resolver as a background task. Returns the
/// task's [`tokio::task::JoinHandle`]; a server exit is logged, never
/// propagated to the caller, mirroring reconciliation's "never fails the
/// whole process" policy (`spec.md` §7).
pub fn spawn_dns_resolver(
    view: Arc<dyn IngressView>,
    listen_address: std::net::SocketAddr,
    suffix: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = dns::run(view, listen_address, &suffix).await {
            warn!(error = %e, "dns resolver task exited with error");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeView {
        ips: HashMap<String, Ipv4Addr>,
    }

    #[async_trait::async_trait]
    impl IngressView for FakeView {
        async fn resolve_ip(&self, name: &str) -> Option<Ipv4Addr> {
            self.ips.get(name).copied()
        }
        async fn instance_exists(&self, name: &str) -> bool {
            self.ips.contains_key(name)
        }
    }

    fn rule(hostname: &str, port: u16, target: &str) -> Rule {
        Rule {
            hostname_pattern: hostname.to_string(),
            listen_port: port,
            target_instance: target.to_string(),
            target_port: 8080,
            tls: false,
            http_redirect: false,
        }
    }

    async fn make_manager() -> (tempfile::TempDir, IngressManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = IngressManager::new(
            DataRoot::new(dir.path()),
            "*".to_string(),
            "vm.internal".to_string(),
            "127.0.0.1:5353".to_string(),
            None,
        );
        (dir, mgr)
    }

    #[test]
    fn resolve_id_ambiguous_prefix_reports_all_candidates() {
        // spec.md §8 scenario 2, exercised directly against the lookup
        // table without requiring a live proxy.
        let mut ingresses = HashMap::new();
        ingresses.insert(
            "abc123".to_string(),
            Ingress {
                id: "abc123".into(),
                name: "a".into(),
                rules: vec![],
                created_at: "2026-01-01T00:00:00Z".into(),
            },
        );
        ingresses.insert(
            "abc456".to_string(),
            Ingress {
                id: "abc456".into(),
                name: "b".into(),
                rules: vec![],
                created_at: "2026-01-01T00:00:00Z".into(),
            },
        );
        let matches: Vec<&String> = ingresses.keys().filter(|id| id.starts_with("abc")).collect();
        assert_eq!(matches.len(), 2);
        let matches1: Vec<&String> = ingresses.keys().filter(|id| id.starts_with("abc1")).collect();
        assert_eq!(matches1, vec![&"abc123".to_string()]);
    }

    #[tokio::test]
    async fn check_port_conflicts_rejects_same_hostname_and_port() {
        let (_dir, mgr) = make_manager().await;
        let existing = Ingress {
            id: "i1".into(),
            name: "first".into(),
            rules: vec![rule("api.ex.com", 80, "web")],
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        let mut map = HashMap::new();
        map.insert(existing.id.clone(), existing);

        let err = mgr
            .check_port_conflicts(&map, &[rule("api.ex.com", 80, "web2")])
            .unwrap_err();
        assert!(matches!(err, HypemanError::InUse { .. }));

        mgr.check_port_conflicts(&map, &[rule("api.ex.com", 443, "web2")])
            .unwrap();
    }

    #[tokio::test]
    async fn validate_rules_rejects_tls_without_acme_configured() {
        let (_dir, mgr) = make_manager().await;
        let mut r = rule("api.ex.com", 443, "web");
        r.tls = true;
        let err = mgr.validate_rules(&[r]).unwrap_err();
        assert!(matches!(err, HypemanError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn validate_rules_rejects_hostname_outside_allowed_domains() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = IngressManager::new(
            DataRoot::new(dir.path()),
            "*.example.com".to_string(),
            "vm.internal".to_string(),
            "127.0.0.1:5353".to_string(),
            None,
        );
        let err = mgr.validate_rules(&[rule("api.example.org", 80, "web")]).unwrap_err();
        assert!(matches!(err, HypemanError::InvalidRequest(_)));
    }
}
