//! Builds the JSON config Caddy's admin API consumes (`spec.md` §4.6).
//!
//! Hand-rolled `serde_json::Value` tree, not a generated Caddy config crate
//! — none of the example repos carry one, and the admin API's documented
//! contract is plain JSON, so building it directly keeps this module free
//! of an extra dependency.

use serde_json::{Value, json};

use super::model::{Ingress, Rule};
use super::pattern::HostPattern;

/// Builds the full proxy config for every persisted ingress plus, if given,
/// one not-yet-persisted candidate (used to validate a Create before the
/// ingress is written to disk).
pub fn build(
    ingresses: &[Ingress],
    candidate: Option<&[Rule]>,
    dns_suffix: &str,
    dns_listen_address: &str,
    acme_email: Option<&str>,
) -> Value {
    let mut routes = Vec::new();
    let mut tls_hosts = Vec::new();

    let mut push = |rule: &Rule| {
        routes.push(route_for(rule, dns_suffix));
        if rule.tls {
            tls_hosts.push(rule.hostname_pattern.clone());
        }
    };
    for ingress in ingresses {
        ingress.rules.iter().for_each(&mut push);
    }
    if let Some(rules) = candidate {
        rules.iter().for_each(&mut push);
    }

    let resolver_addr = dns_listen_address.to_string();

    let mut tls_automation = Value::Null;
    if !tls_hosts.is_empty() {
        let mut policy = json!({
            "subjects": tls_hosts,
        });
        if let Some(email) = acme_email {
            policy["issuers"] = json!([{ "module": "acme", "email": email }]);
        }
        tls_automation = json!({ "policies": [policy] });
    }

    let mut apps = json!({
        "http": {
            "servers": {
                "srv0": {
                    "listen": [":443", ":80"],
                    "routes": routes,
                }
            }
        },
        "dns": {
            "resolvers": [resolver_addr],
        }
    });
    if !tls_automation.is_null() {
        apps["tls"] = json!({ "automation": tls_automation });
    }

    json!({ "apps": apps })
}

fn route_for(rule: &Rule, dns_suffix: &str) -> Value {
    let dial = format!("{{http.request.host.labels.0}}.{dns_suffix}:{}", rule.target_port);
    let mut handlers = Vec::new();
    if rule.http_redirect && rule.tls {
        handlers.push(json!({
            "handler": "static_response",
            "status_code": 308,
            "headers": { "Location": ["https://{http.request.host}{http.request.uri}"] },
        }));
    }
    handlers.push(json!({
        "handler": "reverse_proxy",
        "upstreams": [{ "dial": dial }],
    }));

    json!({
        "match": [{ "host": [caddy_host_matcher(&rule.hostname_pattern)] }],
        "handle": handlers,
        "terminal": true,
    })
}

/// Caddy's `host` matcher accepts literal hostnames directly; a single
/// leading capture label (`{instance}.example.com`) becomes a `*` glob
/// (`*.example.com`), matching the pattern parser's own one-capture-per-
/// label rule.
fn caddy_host_matcher(hostname_pattern: &str) -> String {
    let parsed = HostPattern::parse(hostname_pattern);
    if let Ok(p) = parsed {
        if !p.is_literal() {
            if let Some(rest) = hostname_pattern.split_once('.') {
                return format!("*.{}", rest.1);
            }
            return "*".to_string();
        }
    }
    hostname_pattern.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::model::Rule;

    fn rule(hostname: &str, port: u16, tls: bool) -> Rule {
        Rule {
            hostname_pattern: hostname.to_string(),
            listen_port: if tls { 443 } else { 80 },
            target_instance: "web".to_string(),
            target_port: port,
            tls,
            http_redirect: tls,
        }
    }

    #[test]
    fn literal_hostname_becomes_exact_host_match() {
        let cfg = build(&[], Some(&[rule("api.ex.com", 80, false)]), "vm.internal", "127.0.0.1:5353", None);
        let host = &cfg["apps"]["http"]["servers"]["srv0"]["routes"][0]["match"][0]["host"][0];
        assert_eq!(host, "api.ex.com");
    }

    #[test]
    fn pattern_hostname_becomes_glob_host_match() {
        let cfg = build(
            &[],
            Some(&[rule("{instance}.example.com", 80, false)]),
            "vm.internal",
            "127.0.0.1:5353",
            None,
        );
        let host = &cfg["apps"]["http"]["servers"]["srv0"]["routes"][0]["match"][0]["host"][0];
        assert_eq!(host, "*.example.com");
    }

    #[test]
    fn tls_rule_adds_automation_policy_with_its_hostname() {
        let cfg = build(&[], Some(&[rule("api.ex.com", 443, true)]), "vm.internal", "127.0.0.1:5353", Some("ops@ex.com"));
        let subjects = &cfg["apps"]["tls"]["automation"]["policies"][0]["subjects"];
        assert_eq!(subjects[0], "api.ex.com");
    }
}
