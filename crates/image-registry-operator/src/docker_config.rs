//! Renders registry credentials into the Docker `config.json` format understood
//! by container runtimes and image build tools.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(display("failed to serialize docker config"))]
pub struct EncodeError {
    source: serde_json::Error,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct DockerConfig {
    pub auths: BTreeMap<String, DockerAuth>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct DockerAuth {
    pub auth: String,
}

impl DockerConfig {
    pub fn with_auth(mut self, hostname: &str, username: &str, password: &str) -> Self {
        self.auths.insert(
            hostname.to_owned(),
            DockerAuth {
                auth: auth_token(username, password),
            },
        );
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(self).context(EncodeSnafu)
    }
}

/// Returns the base64 encoded `username:password` pair used in HTTP Basic auth.
pub fn auth_token(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{username}:{password}"))
}

/// Renders a config that authenticates `username` against a single registry.
pub fn render(hostname: &str, username: &str, password: &str) -> Result<Vec<u8>, EncodeError> {
    DockerConfig::default()
        .with_auth(hostname, username, password)
        .to_json()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_auth_envelope() {
        let json =
            render("registry.infra.svc.cluster.local", "pull.app.pull-1.1", "s3cr=t").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "auths": {
                    "registry.infra.svc.cluster.local": {
                        "auth": "cHVsbC5hcHAucHVsbC0xLjE6czNjcj10"
                    }
                }
            })
        );
    }

    #[test]
    fn auth_token_decodes_to_user_and_password() {
        let token = auth_token("user", "pass:word");
        let decoded = STANDARD.decode(token).unwrap();
        assert_eq!(decoded, b"user:pass:word");
    }

    #[test]
    fn rendering_is_deterministic() {
        let first = render("host", "user", "pw").unwrap();
        let second = render("host", "user", "pw").unwrap();
        assert_eq!(first, second);
    }
}
