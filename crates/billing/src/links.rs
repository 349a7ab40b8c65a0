//! Access link construction.
//!
//! Builds the `vless://` connection URI handed to subscribers. All transport
//! parameters come from configuration captured at startup; issuing code never
//! inspects the proxy server's own config.

use uuid::Uuid;

/// Transport security profile for composed links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSecurity {
    None,
    Tls { sni: String },
    Reality {
        public_key: String,
        short_id: String,
        sni: String,
        fingerprint: String,
    },
}

#[derive(Debug, Clone)]
pub struct AccessLinkBuilder {
    host: String,
    port: u16,
    security: LinkSecurity,
}

impl AccessLinkBuilder {
    pub fn new(host: impl Into<String>, port: u16, security: LinkSecurity) -> Self {
        Self {
            host: host.into(),
            port,
            security,
        }
    }

    /// Read link parameters from the environment. Absent security settings
    /// fall back to a plain TCP link.
    pub fn from_env() -> Self {
        let host = std::env::var("VLESS_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("VLESS_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(443);

        let security = match std::env::var("VLESS_SECURITY").as_deref() {
            Ok("tls") => LinkSecurity::Tls {
                sni: std::env::var("VLESS_SNI").unwrap_or_else(|_| host.clone()),
            },
            Ok("reality") => LinkSecurity::Reality {
                public_key: std::env::var("VLESS_REALITY_PUBLIC_KEY").unwrap_or_default(),
                short_id: std::env::var("VLESS_REALITY_SHORT_ID").unwrap_or_default(),
                sni: std::env::var("VLESS_SNI").unwrap_or_else(|_| host.clone()),
                fingerprint: std::env::var("VLESS_REALITY_FINGERPRINT")
                    .unwrap_or_else(|_| "chrome".to_string()),
            },
            _ => LinkSecurity::None,
        };

        Self::new(host, port, security)
    }

    /// Compose the connection URI for a client identity.
    pub fn build(&self, uuid: Uuid, label: &str) -> String {
        let mut params = vec![("encryption", "none".to_string()), ("type", "tcp".to_string())];

        match &self.security {
            LinkSecurity::None => {}
            LinkSecurity::Tls { sni } => {
                params.push(("security", "tls".to_string()));
                params.push(("sni", sni.clone()));
            }
            LinkSecurity::Reality {
                public_key,
                short_id,
                sni,
                fingerprint,
            } => {
                params.push(("security", "reality".to_string()));
                params.push(("pbk", public_key.clone()));
                if !short_id.is_empty() {
                    params.push(("sid", short_id.clone()));
                }
                params.push(("sni", sni.clone()));
                params.push(("fp", fingerprint.clone()));
                params.push(("flow", "xtls-rprx-vision".to_string()));
            }
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");

        format!(
            "vless://{uuid}@{}:{}?{}#{}",
            self.host,
            self.port,
            query,
            urlencode(label)
        )
    }
}

/// Minimal percent-encoding for query values and fragments.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' | b',' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_link_has_host_port_and_label() {
        let builder = AccessLinkBuilder::new("vpn.example.org", 2053, LinkSecurity::None);
        let uuid = Uuid::new_v4();
        let link = builder.build(uuid, "KEY alice");
        assert!(link.starts_with(&format!("vless://{uuid}@vpn.example.org:2053?")));
        assert!(link.contains("encryption=none"));
        assert!(link.ends_with("#KEY%20alice"));
    }

    #[test]
    fn reality_link_carries_security_params() {
        let builder = AccessLinkBuilder::new(
            "vpn.example.org",
            443,
            LinkSecurity::Reality {
                public_key: "pbk123".to_string(),
                short_id: "ab".to_string(),
                sni: "cdn.example.org".to_string(),
                fingerprint: "chrome".to_string(),
            },
        );
        let link = builder.build(Uuid::new_v4(), "key");
        assert!(link.contains("security=reality"));
        assert!(link.contains("pbk=pbk123"));
        assert!(link.contains("sid=ab"));
        assert!(link.contains("flow=xtls-rprx-vision"));
    }
}
