use std::{collections::HashSet, net::IpAddr};

use log::debug;

use super::{DeployError, host::SiteInventory};
use crate::{
    core::types::{BindEndpoint, BindingTarget, CertificateConfig},
    domain::host_matches,
};

/// Resolves where a certificate should be bound: explicit rules as written, or
/// in auto-bind mode every `https` listener whose host header or IP matches
/// one of the certificate's domains.
pub fn resolve_targets(
    config: &CertificateConfig,
    inventory: &dyn SiteInventory,
) -> Result<Vec<BindingTarget>, DeployError> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    let mut push = |target: BindingTarget| {
        if seen.insert((target.endpoint.clone(), target.port)) {
            targets.push(target);
        }
    };

    if !config.auto_bind {
        for rule in &config.bind_rules {
            let mut target = match parse_ip(&rule.domain) {
                Some(ip) => BindingTarget::ip(&rule.domain, ip, rule.port),
                None => BindingTarget::sni(&rule.domain, &rule.domain, rule.port),
            };
            target.site_name = rule.site_name.clone();
            push(target);
        }
        return Ok(targets);
    }

    let domains = config.all_domains();
    for site in inventory.sites()? {
        for binding in site.bindings.iter().filter(|b| b.protocol.eq_ignore_ascii_case("https")) {
            let endpoint = if !binding.host.is_empty() {
                if !domains.iter().any(|d| host_matches(d, &binding.host)) {
                    continue;
                }
                BindEndpoint::Sni(binding.host.to_lowercase())
            } else {
                match binding.ip {
                    Some(ip) if domains.iter().any(|d| parse_ip(d) == Some(ip)) => {
                        BindEndpoint::Ip(ip)
                    }
                    _ => continue,
                }
            };
            let domain = match &endpoint {
                BindEndpoint::Sni(host) => host.clone(),
                BindEndpoint::Ip(ip) => ip.to_string(),
            };
            debug!(
                "[deploy] site {} listener {}:{} matches {}",
                site.name, domain, binding.port, config.domain
            );
            push(BindingTarget {
                domain,
                endpoint,
                port: binding.port,
                site_name: Some(site.name.clone()),
            });
        }
    }
    Ok(targets)
}

fn parse_ip(domain: &str) -> Option<IpAddr> {
    domain.trim_matches(|c| c == '[' || c == ']').parse().ok()
}
