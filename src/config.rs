//! Engine configuration.
//!
//! Settings live in the local `local_settings` table under the `pos`
//! category so the terminal keeps its pairing across restarts. The
//! prepayment policy is read once here and then passed explicitly into the
//! order guards; nothing downstream reaches back into settings.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rusqlite::Connection;
use serde_json::Value;

use crate::db;
use crate::error::PosResult;

const SETTINGS_CATEGORY: &str = "pos";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Policy flags consumed by the order state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrderPolicy {
    /// Orders must be paid before they may enter `process`.
    pub prepayment_required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_url: String,
    pub api_key: String,
    pub terminal_id: String,
    pub policy: OrderPolicy,
    /// `None` disables background polling; mutations still revalidate.
    pub poll_interval: Option<Duration>,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            terminal_id: String::new(),
            policy: OrderPolicy::default(),
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Read the configuration from local settings, falling back to defaults.
    pub fn load(conn: &Connection) -> Self {
        let get = |key: &str| db::get_setting(conn, SETTINGS_CATEGORY, key);
        let mut cfg = EngineConfig::default();

        if let Some(raw) = get("connection_string") {
            cfg.apply_connection_string(&raw);
        }
        if let Some(url) = get("api_url") {
            cfg.api_url = normalize_api_url(&url);
        }
        if let Some(key) = get("api_key") {
            cfg.api_key = key;
        }
        if let Some(tid) = get("terminal_id") {
            cfg.terminal_id = tid;
        }
        cfg.policy.prepayment_required = get("prepayment_required")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        if let Some(secs) = get("poll_interval_secs").and_then(|v| v.trim().parse::<u64>().ok()) {
            cfg.poll_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = get("request_timeout_secs")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            cfg.request_timeout = Duration::from_secs(secs);
        }
        cfg
    }

    /// Persist the fields an operator can change from the settings screen.
    pub fn save(&self, conn: &Connection) -> PosResult<()> {
        let secs = self.poll_interval.map(|d| d.as_secs()).unwrap_or(0);
        db::set_setting(conn, SETTINGS_CATEGORY, "api_url", &self.api_url)?;
        db::set_setting(conn, SETTINGS_CATEGORY, "api_key", &self.api_key)?;
        db::set_setting(conn, SETTINGS_CATEGORY, "terminal_id", &self.terminal_id)?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "prepayment_required",
            if self.policy.prepayment_required { "1" } else { "0" },
        )?;
        db::set_setting(conn, SETTINGS_CATEGORY, "poll_interval_secs", &secs.to_string())?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "request_timeout_secs",
            &self.request_timeout.as_secs().to_string(),
        )?;
        Ok(())
    }

    /// Fill url/key/terminal from a pairing connection string, keeping any
    /// field the string does not carry.
    pub fn apply_connection_string(&mut self, raw: &str) {
        if let Some(url) = extract_api_url_from_connection_string(raw) {
            self.api_url = url;
        }
        if let Some(key) = extract_api_key_from_connection_string(raw) {
            self.api_key = key;
        }
        if let Some(tid) = extract_terminal_id_from_connection_string(raw) {
            self.terminal_id = tid;
        }
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the POS API URL: no trailing slash or `/api` segment, and a
/// scheme (plain http only for a local server).
pub fn normalize_api_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix("/api").unwrap_or(url).trim_end_matches('/');
    if url.is_empty() || url.contains("://") {
        return url.to_string();
    }
    let scheme = if is_local_server(url) { "http" } else { "https" };
    format!("{scheme}://{url}")
}

fn is_local_server(host: &str) -> bool {
    host.starts_with("localhost") || host.starts_with("127.0.0.1")
}

// ---------------------------------------------------------------------------
// Connection string
// ---------------------------------------------------------------------------

/// The pairing QR code carries a JSON object, either verbatim or as
/// base64url. Standard-alphabet and padded input is accepted too.
fn decode_pairing_payload(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.starts_with('{') {
        return serde_json::from_str(raw).ok();
    }
    let encoded: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    if encoded.len() < 20 {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn connection_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_pairing_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_field(raw, &["key"])
}

pub fn extract_api_url_from_connection_string(raw: &str) -> Option<String> {
    connection_field(raw, &["url"]).map(|u| normalize_api_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_field(raw, &["tid", "terminalId"])
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn test_normalize_api_url() {
        assert_eq!(normalize_api_url("kasir.example.com/api/"), "https://kasir.example.com");
        assert_eq!(normalize_api_url("localhost:3000/"), "http://localhost:3000");
        assert_eq!(normalize_api_url("https://pos.cafe.id"), "https://pos.cafe.id");
        assert_eq!(normalize_api_url("  "), "");
    }

    #[test]
    fn test_connection_string_json_and_base64() {
        let json = r#"{"url":"pos.cafe.id/api","key":"k-123","tid":"term-9"}"#;
        assert_eq!(
            extract_api_url_from_connection_string(json).as_deref(),
            Some("https://pos.cafe.id")
        );

        let encoded = URL_SAFE_NO_PAD.encode(json);
        assert_eq!(extract_api_key_from_connection_string(&encoded).as_deref(), Some("k-123"));
        assert_eq!(
            extract_terminal_id_from_connection_string(&encoded).as_deref(),
            Some("term-9")
        );

        let padded = base64::engine::general_purpose::STANDARD.encode(json);
        assert_eq!(extract_api_key_from_connection_string(&padded).as_deref(), Some("k-123"));
        assert_eq!(extract_api_key_from_connection_string("short"), None);
    }

    #[test]
    fn test_load_defaults_when_unset() {
        let conn = test_conn();
        let cfg = EngineConfig::load(&conn);
        assert_eq!(cfg, EngineConfig::default());
        assert!(!cfg.policy.prepayment_required);
    }

    #[test]
    fn test_save_then_load() {
        let conn = test_conn();
        let cfg = EngineConfig {
            api_url: "https://pos.cafe.id".into(),
            api_key: "secret".into(),
            terminal_id: "term-1".into(),
            policy: OrderPolicy {
                prepayment_required: true,
            },
            poll_interval: None,
            request_timeout: Duration::from_secs(15),
        };
        cfg.save(&conn).unwrap();
        assert_eq!(EngineConfig::load(&conn), cfg);
    }

    #[test]
    fn test_explicit_url_overrides_connection_string() {
        let conn = test_conn();
        db::set_setting(
            &conn,
            "pos",
            "connection_string",
            r#"{"url":"old.cafe.id","key":"k-1"}"#,
        )
        .unwrap();
        db::set_setting(&conn, "pos", "api_url", "new.cafe.id").unwrap();
        let cfg = EngineConfig::load(&conn);
        assert_eq!(cfg.api_url, "https://new.cafe.id");
        assert_eq!(cfg.api_key, "k-1");
    }
}
