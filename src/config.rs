use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Settings for one LDAP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Server endpoint: "ldap://host[:port]" or "ldaps://host[:port]".
    pub url: String,
    /// TCP connect timeout in seconds (default 10).
    pub connect_timeout_sec: Option<u64>,
    /// Per-operation response timeout in seconds (default 30).
    pub operation_timeout_sec: Option<u64>,
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Upgrade a plain ldap:// connection with StartTLS right after
    /// connecting. Ignored for ldaps:// URLs.
    pub starttls: Option<bool>,
    /// Do not verify the server certificate (only for tests/internal networks).
    pub skip_verify: Option<bool>,
    /// Extra PEM CA bundle trusted in addition to the system roots.
    pub ca_file: Option<String>,
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout_sec: None,
            operation_timeout_sec: None,
            tls: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: ConnectionSettings = serde_yaml::from_str(&content)?;
        Ok(settings)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let settings: ConnectionSettings = serde_yaml::from_str(content)?;
        Ok(settings)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec.unwrap_or(10))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_sec.unwrap_or(30))
    }

    pub fn use_starttls(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(|t| t.starttls)
            .unwrap_or(false)
    }

    pub fn tls_skip_verify(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(|t| t.skip_verify)
            .unwrap_or(false)
    }

    pub fn tls_ca_file(&self) -> Option<&str> {
        self.tls.as_ref().and_then(|t| t.ca_file.as_deref())
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new("ldap://127.0.0.1:389")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_settings_default() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.url, "ldap://127.0.0.1:389");
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.operation_timeout(), Duration::from_secs(30));
        assert!(!settings.use_starttls());
        assert!(!settings.tls_skip_verify());
    }

    #[test]
    fn test_settings_from_str() {
        let yaml = r#"
url: "ldaps://dc01.corp.example.com:636"
connect_timeout_sec: 5
operation_timeout_sec: 60
tls:
  skip_verify: true
"#;
        let settings = ConnectionSettings::from_str(yaml).unwrap();
        assert_eq!(settings.url, "ldaps://dc01.corp.example.com:636");
        assert_eq!(settings.connect_timeout(), Duration::from_secs(5));
        assert_eq!(settings.operation_timeout(), Duration::from_secs(60));
        assert!(settings.tls_skip_verify());
    }

    #[test]
    fn test_settings_from_str_minimal() {
        let settings = ConnectionSettings::from_str("url: \"ldap://dc01:389\"\n").unwrap();
        assert_eq!(settings.url, "ldap://dc01:389");
        assert!(settings.tls.is_none());
    }

    #[test]
    fn test_settings_starttls() {
        let yaml = r#"
url: "ldap://dc01:389"
tls:
  starttls: true
  ca_file: "/etc/ssl/corp-ca.pem"
"#;
        let settings = ConnectionSettings::from_str(yaml).unwrap();
        assert!(settings.use_starttls());
        assert_eq!(settings.tls_ca_file(), Some("/etc/ssl/corp-ca.pem"));
    }

    #[test]
    fn test_settings_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "url: \"ldap://dc02:3268\"\noperation_timeout_sec: 15\n").unwrap();
        let settings = ConnectionSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.url, "ldap://dc02:3268");
        assert_eq!(settings.operation_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_settings_from_str_invalid_yaml() {
        assert!(ConnectionSettings::from_str("url: [not, a, string").is_err());
    }

    #[test]
    fn test_settings_from_file_nonexistent() {
        assert!(ConnectionSettings::from_file("/nonexistent/settings.yaml").is_err());
    }
}
