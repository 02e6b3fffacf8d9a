//! Deterministic rendering of an OnionService into the daemon's config
//! grammar. Same input yields byte-identical output, which is what makes
//! diff-based reload avoidance sound.

use std::fmt::Write as _;

use onion_core::{RenderError, Settings};
use onion_kubehub::OnionService;

/// Render the config file content for the given resource.
///
/// Port targets point at the backing service's cluster IP from the
/// status; while the status carries no IP yet, loopback is used so the
/// file stays a valid config, and the next status change re-renders.
pub fn render(svc: &OnionService, settings: &Settings) -> Result<String, RenderError> {
    let spec = &svc.spec;
    if !matches!(spec.version, 2 | 3) {
        return Err(RenderError::UnsupportedVersion(spec.version));
    }
    let target_ip = svc
        .status
        .as_ref()
        .map(|s| s.target_cluster_ip.as_str())
        .filter(|ip| !ip.is_empty())
        .unwrap_or("127.0.0.1");

    let mut out = String::new();
    let _ = writeln!(out, "SocksPort 0");
    let _ = writeln!(out, "HiddenServiceDir {}", settings.service_dir.display());
    let _ = writeln!(out, "HiddenServiceVersion {}", spec.version);
    for port in &spec.ports {
        let _ = writeln!(
            out,
            "HiddenServicePort {} {}:{}",
            port.public_port, target_ip, port.target_port
        );
    }
    if spec.private_key_secret.is_some() {
        let _ = writeln!(out, "HiddenServiceKeyFile {}", settings.private_key_path.display());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onion_kubehub::{OnionServiceSpec, OnionServiceStatus, SecretReference, ServicePort};

    fn svc(version: u8, target_ip: &str) -> OnionService {
        let mut svc = OnionService::new(
            "my-service",
            OnionServiceSpec {
                version,
                ports: vec![
                    ServicePort { name: "web".into(), public_port: 80, target_port: 8080 },
                    ServicePort { name: "tls".into(), public_port: 443, target_port: 8443 },
                ],
                private_key_secret: None,
                selector: Default::default(),
            },
        );
        svc.status = Some(OnionServiceStatus {
            hostname: String::new(),
            target_cluster_ip: target_ip.into(),
        });
        svc
    }

    #[test]
    fn renders_ports_in_declared_order() {
        let out = render(&svc(3, "10.0.0.7"), &Settings::default()).unwrap();
        assert_eq!(
            out,
            "SocksPort 0\n\
             HiddenServiceDir /run/tor/service\n\
             HiddenServiceVersion 3\n\
             HiddenServicePort 80 10.0.0.7:8080\n\
             HiddenServicePort 443 10.0.0.7:8443\n"
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let s = svc(3, "10.0.0.7");
        let settings = Settings::default();
        assert_eq!(render(&s, &settings).unwrap(), render(&s, &settings).unwrap());
    }

    #[test]
    fn missing_cluster_ip_falls_back_to_loopback() {
        let out = render(&svc(2, ""), &Settings::default()).unwrap();
        assert!(out.contains("HiddenServiceVersion 2\n"));
        assert!(out.contains("HiddenServicePort 80 127.0.0.1:8080\n"));
    }

    #[test]
    fn key_secret_adds_key_file_directive() {
        let mut s = svc(3, "10.0.0.7");
        s.spec.private_key_secret =
            Some(SecretReference { name: "onion-key".into(), key: "private_key".into() });
        let out = render(&s, &Settings::default()).unwrap();
        assert!(out.ends_with("HiddenServiceKeyFile /run/tor/private_key\n"));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = render(&svc(4, "10.0.0.7"), &Settings::default()).unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedVersion(4)));
    }
}
