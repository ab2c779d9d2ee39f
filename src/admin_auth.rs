//! Admin auth — bearer-token guard for the control surface, grounded on
//! the teacher's `AuthGuard` (`auth.rs`): same atomic-write/constant-time-
//! compare/rotate idiom, generalized from a Keychain-backed desktop token to
//! a plain file-backed token suitable for a headless relay daemon.
//!
//! Gates the mutating `fulcrum.admin.*` methods; `fulcrum.health` and
//! `fulcrum.usage` remain open to any local caller on the control socket.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::{info, warn};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 32;

pub struct AdminAuthGuard {
    token_hex: String,
    token_file: PathBuf,
}

impl AdminAuthGuard {
    /// Bootstrap the admin token: load an existing file or generate a fresh
    /// one, writing it back atomically so permissions stay `0600`.
    pub fn bootstrap(token_file: &Path) -> Result<Self> {
        let token_hex = match load_file_token(token_file) {
            Ok(token) => {
                info!("admin token loaded from {}", token_file.display());
                token
            }
            Err(_) => {
                warn!("no admin token found — generating a new one");
                let token = generate_token();
                atomic_write_token_file(token_file, &token)
                    .context("failed to write admin token file")?;
                token
            }
        };
        Ok(Self { token_hex, token_file: token_file.to_path_buf() })
    }

    /// Validate a bearer token supplied by the caller, constant-time.
    pub fn validate(&self, candidate: &str) -> bool {
        constant_time_eq(candidate.trim(), &self.token_hex)
    }

    /// Rotate the token: generate, persist, invalidate the old one.
    pub fn rotate(&mut self) -> Result<String> {
        let new_token = generate_token();
        atomic_write_token_file(&self.token_file, &new_token)
            .context("failed to write rotated admin token file")?;
        self.token_hex.zeroize();
        self.token_hex = new_token.clone();
        info!("admin token rotated — old token invalidated");
        Ok(new_token)
    }

    pub fn token_file_path(&self) -> &Path {
        &self.token_file
    }
}

impl Drop for AdminAuthGuard {
    fn drop(&mut self) {
        self.token_hex.zeroize();
    }
}

/// Methods that require a valid admin bearer token.
pub fn requires_admin(method: &str) -> bool {
    method.starts_with("fulcrum.admin.")
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex = hex::encode(bytes);
    bytes.zeroize();
    hex
}

fn atomic_write_token_file(path: &Path, token: &str) -> Result<()> {
    let tmp_path = path.with_extension("token.tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .context("failed to create temp admin token file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(token.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path).context("atomic rename failed")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn load_file_token(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).context("failed to read admin token file")?;
    let trimmed = content.trim().to_string();
    if trimmed.len() != TOKEN_LEN * 2 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("admin token file contains invalid data (expected {} hex chars)", TOKEN_LEN * 2);
    }
    Ok(trimmed)
}

/// HMAC-SHA256 based constant-time comparison — avoids a branch on byte
/// mismatch without pulling in the `subtle` crate.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let key = b"fulcrum-admin-constant-time-comparison-key";
    let mut mac_a = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    let mut mac_b = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac_a.update(a.as_bytes());
    mac_b.update(b.as_bytes());
    mac_a.finalize().into_bytes() == mac_b.finalize().into_bytes()
}

// ── Per-Caller Rate Limiting ────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Sliding-window rate limiter per caller identity, guarding the control
/// socket itself rather than any per-key admission path (that's RLG's job).
pub struct ControlSurfaceRateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
    max_requests: usize,
    window_secs: u64,
}

impl ControlSurfaceRateLimiter {
    pub fn new(max_requests: usize, window_secs: u64) -> Self {
        Self { windows: Mutex::new(HashMap::new()), max_requests, window_secs }
    }

    /// Returns `Ok(())` if allowed, or `Err(remaining_secs)` if rate-limited.
    pub fn check(&self, caller: &str) -> Result<(), u64> {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let window = std::time::Duration::from_secs(self.window_secs);

        let timestamps = windows.entry(caller.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < window);

        if timestamps.len() >= self.max_requests {
            let oldest = timestamps.first().unwrap();
            let remaining = window.as_secs() - now.duration_since(*oldest).as_secs();
            return Err(remaining);
        }
        timestamps.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_admin_gates_only_admin_namespace() {
        assert!(requires_admin("fulcrum.admin.addKey"));
        assert!(requires_admin("fulcrum.admin.rotateToken"));
        assert!(!requires_admin("fulcrum.health"));
        assert!(!requires_admin("fulcrum.usage"));
    }

    #[test]
    fn bootstrap_generates_and_persists_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fulcrum.token");
        let guard = AdminAuthGuard::bootstrap(&path).unwrap();
        assert!(path.exists());
        assert!(guard.validate(&fs::read_to_string(&path).unwrap().trim()));
    }

    #[test]
    fn bootstrap_reuses_an_existing_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fulcrum.token");
        let first = AdminAuthGuard::bootstrap(&path).unwrap();
        let token = fs::read_to_string(&path).unwrap().trim().to_string();
        let second = AdminAuthGuard::bootstrap(&path).unwrap();
        assert!(first.validate(&token));
        assert!(second.validate(&token));
    }

    #[test]
    fn validate_rejects_wrong_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fulcrum.token");
        let guard = AdminAuthGuard::bootstrap(&path).unwrap();
        assert!(!guard.validate("not-the-real-token"));
    }

    #[test]
    fn control_surface_rate_limiter_blocks_over_limit() {
        let limiter = ControlSurfaceRateLimiter::new(2, 60);
        assert!(limiter.check("caller-1").is_ok());
        assert!(limiter.check("caller-1").is_ok());
        assert!(limiter.check("caller-1").is_err());
        assert!(limiter.check("caller-2").is_ok(), "different caller has its own window");
    }

    #[test]
    fn rotate_invalidates_the_old_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fulcrum.token");
        let mut guard = AdminAuthGuard::bootstrap(&path).unwrap();
        let old = fs::read_to_string(&path).unwrap().trim().to_string();
        let new_token = guard.rotate().unwrap();
        assert!(!guard.validate(&old));
        assert!(guard.validate(&new_token));
    }
}
